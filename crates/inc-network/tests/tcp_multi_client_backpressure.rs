use std::{
    io::Read,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener},
    thread,
    time::Duration,
};

use bytes::Bytes;
use inc_network::frame::{HEADER_SIZE, Header, Message, MessageType};
use inc_network::tcp::{SendBehavior, TcpConnector};
use mio::Token;

fn spawn_frame_collector(read_delay: Duration) -> (SocketAddr, thread::JoinHandle<Vec<Vec<u8>>>) {
    let listener = TcpListener::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("failed to fetch listener addr");

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("failed to accept connection");
        if !read_delay.is_zero() {
            thread::sleep(read_delay);
        }

        let mut frames = Vec::new();
        loop {
            let mut header_buf = [0_u8; HEADER_SIZE];
            match stream.read_exact(&mut header_buf) {
                Ok(()) => {
                    let header = match Header::decode(&header_buf) {
                        Ok(h) => h,
                        Err(_) => break,
                    };
                    let mut payload = vec![0_u8; header.payload_len as usize];
                    if stream.read_exact(&mut payload).is_err() {
                        break;
                    }
                    frames.push(payload);
                }
                Err(_) => break,
            }
        }

        frames
    });

    (addr, handle)
}

fn pump(conn: &mut TcpConnector, for_how_long: Duration) {
    let deadline = std::time::Instant::now() + for_how_long;
    while std::time::Instant::now() < deadline {
        while conn.poll_with(|_| {}) {}
        thread::sleep(Duration::from_millis(1));
    }
}

fn send_payload(conn: &mut TcpConnector, token: Token, payload: &[u8]) {
    let msg = Message::control(MessageType::BinaryData, 0, Bytes::copy_from_slice(payload));
    conn.write_or_enqueue(SendBehavior::Single(token), &msg);
}

#[test]
fn queued_messages_flush_on_second_connection_after_backpressure() {
    let (fast_addr, fast_handle) = spawn_frame_collector(Duration::from_millis(0));
    let (slow_addr, slow_handle) = spawn_frame_collector(Duration::from_millis(700));

    let mut conn = TcpConnector::default().with_socket_buf_size(1024);
    let fast_token = conn.connect(fast_addr).expect("failed to connect to fast collector");
    let slow_token = conn.connect(slow_addr).expect("failed to connect to slow collector");
    assert_ne!(fast_token, slow_token);

    // Fill the 2nd socket while the receiver is paused, forcing queue/backpressure
    // path.
    let big = vec![7_u8; 8 * 1024 * 1024];
    send_payload(&mut conn, slow_token, &big);

    let marker = b"marker-after-backpressure".to_vec();
    send_payload(&mut conn, slow_token, &marker);
    send_payload(&mut conn, fast_token, b"fast-keepalive");

    // The slow side starts reading after the delay. If token handling is correct,
    // queued frames should eventually flush and marker should be observed.
    pump(&mut conn, Duration::from_secs(5));
    drop(conn);

    let fast_frames = fast_handle.join().expect("fast collector thread panicked");
    let slow_frames = slow_handle.join().expect("slow collector thread panicked");

    assert!(
        fast_frames.iter().any(|f| f == b"fast-keepalive"),
        "sanity check failed: fast collector did not receive data"
    );
    assert!(
        slow_frames.iter().any(|f| f == &marker),
        "slow collector never received marker after backpressure was released"
    );
}
