use mictcp::{Mode, SockAddr, Stack};

fn main() {
    env_logger::init();

    let stack = Stack::new();

    let fd = stack.socket(Mode::Client).unwrap();
    stack
        .bind(
            fd,
            SockAddr::new("127.0.0.1:0".parse().unwrap(), 34343),
        )
        .unwrap();

    println!(">>> Trying to connect to server...");
    stack
        .connect(
            fd,
            SockAddr::new("127.0.0.1:8724".parse().unwrap(), 9090),
        )
        .unwrap();
    println!(">>> Connected!");

    for i in 0..50 {
        let msg = format!("frame {i:03}");
        let n = stack.send(fd, msg.as_bytes()).unwrap();

        println!(">>> Sent: {msg} ({n} bytes)");
    }

    stack.close(fd).unwrap();
}
