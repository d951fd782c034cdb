use mictcp::{Mode, SockAddr, Stack};

fn main() {
    env_logger::init();

    let stack = Stack::new();

    let fd = stack.socket(Mode::Server).unwrap();
    stack
        .bind(
            fd,
            SockAddr::new("127.0.0.1:8724".parse().unwrap(), 9090),
        )
        .unwrap();

    println!(">>> Waiting for incoming connections...");
    let remote = stack.accept(fd).unwrap();
    println!(">>> Connection accepted from {:?}", remote.ip_addr);

    loop {
        let mut buf = [0u8; 1500];
        let n = stack.recv(fd, &mut buf[..]).unwrap();

        if n == 0 {
            break;
        }

        println!(
            "\n>>> Received: {:?}\n",
            String::from_utf8_lossy(&buf[..n])
        );
    }

    stack.close(fd).unwrap();
}
