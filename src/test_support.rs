use socket2::{Domain, Socket, Type};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    time::{sleep, timeout},
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Two ends of one loopback TCP connection.
pub async fn connected_streams() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (connected.unwrap(), accepted.unwrap().0)
}

/// Finds an unused port by binding to port 0
pub async fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Starts TCP echo server on free port; also returns the number of accepted connections
pub async fn start_echo_server() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buffer = [0; 4096];
                loop {
                    match stream.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) if stream.write_all(&buffer[..n]).await.is_err() => break,
                        Ok(_) => {}
                    }
                }
            });
        }
    });

    (port, accepted)
}

/// Creates TCP server that captures all data received on its first connection
pub async fn create_capturing_server() -> (u16, Arc<Mutex<Vec<u8>>>) {
    let received_data = Arc::new(Mutex::new(Vec::new()));
    let received_data_clone = received_data.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buffer = [0u8; 1024];
            while let Ok(n) = stream.read(&mut buffer).await {
                if n == 0 {
                    break;
                }
                received_data_clone
                    .lock()
                    .await
                    .extend_from_slice(&buffer[..n]);
            }
        }
    });

    (port, received_data)
}

/// Creates TCP server that sends `data` to its first connection, then closes it
pub async fn create_sending_server(data: Vec<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(&data).await;
        }
    });

    port
}

/// A listener that never accepts and whose accept queue is full, so new
/// connects to it hang.
pub struct StalledServer {
    pub port: u16,
    _listener: socket2::Socket,
    _queued: Vec<TcpStream>,
}

pub async fn start_stalled_server() -> StalledServer {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    listener.bind(&loopback(0).into()).unwrap();
    listener.listen(0).unwrap();
    let port = listener.local_addr().unwrap().as_socket().unwrap().port();

    // the kernel drops SYNs once the queue is full
    let mut queued = Vec::new();
    for _ in 0..16 {
        match timeout(Duration::from_millis(150), TcpStream::connect(loopback(port))).await {
            Ok(Ok(stream)) => queued.push(stream),
            Ok(Err(e)) => panic!("unexpected connect error: {e}"),
            Err(_) => break,
        }
    }

    StalledServer {
        port,
        _listener: listener,
        _queued: queued,
    }
}

/// Polls `condition` until it holds or `TEST_TIMEOUT` elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    timeout(TEST_TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Reads until `len` bytes arrived or the peer closed.
pub async fn read_up_to(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(len);
    let mut buffer = [0u8; 4096];
    while received.len() < len {
        match timeout(TEST_TIMEOUT, stream.read(&mut buffer)).await {
            Ok(Ok(0) | Err(_)) | Err(_) => break,
            Ok(Ok(n)) => received.extend_from_slice(&buffer[..n]),
        }
    }
    received
}

/// True if the peer closed (or reset) the connection without sending data.
pub async fn is_closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buffer = [0u8; 16];
    matches!(
        timeout(TEST_TIMEOUT, stream.read(&mut buffer)).await,
        Ok(Ok(0) | Err(_))
    )
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
