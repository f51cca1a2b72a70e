//! Echo server on the fiber runtime.
//!
//! ```text
//! cargo run --example echo -- 127.0.0.1:8020
//! ```

use std::io::{Read, Write};

use filament::io::IoManager;
use filament::net::{TcpServer, TcpStream};

fn main() {
    env_logger::init();
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8020".into());

    let io = IoManager::new(2, false, "echo").expect("failed to start runtime");
    let server = TcpServer::new(io.clone(), io.clone(), |mut client: TcpStream| {
        let mut buf = [0u8; 4096];
        loop {
            match client.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    server.bind(addr.as_str()).expect("bind failed");
    server.start();
    log::info!("echo server on {}", addr);

    loop {
        std::thread::park();
    }
}
