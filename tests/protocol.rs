use std::net::SocketAddr;
use std::time::Duration;

use chained_beans::broker::{Broker, BrokerConfig};
use chained_beans::server;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    _cancel: DropGuard,
}

impl TestServer {
    async fn start(config: BrokerConfig) -> Self {
        let broker = Broker::new(config);
        let cancel = CancellationToken::new();
        broker.spawn_sweepers(&cancel);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (hold, _) = mpsc::channel(1);
        tokio::spawn(server::serve(listener, broker, cancel.clone(), hold));

        Self {
            addr,
            _cancel: cancel.drop_guard(),
        }
    }

    async fn client(&self) -> Client {
        let (r, w) = TcpStream::connect(self.addr).await.unwrap().into_split();
        Client {
            r: BufReader::new(r),
            w,
        }
    }
}

struct Client {
    r: BufReader<OwnedReadHalf>,
    w: OwnedWriteHalf,
}

impl Client {
    async fn send(&mut self, data: &[u8]) {
        self.w.write_all(data).await.unwrap();
    }

    /// Reads one response line without its CRLF. Empty at end of stream.
    async fn line(&mut self) -> String {
        let mut buf = vec![];
        timeout(IO_TIMEOUT, self.r.read_until(b'\n', &mut buf))
            .await
            .expect("timed out waiting for a response")
            .unwrap();
        let line = String::from_utf8(buf).unwrap();
        line.trim_end_matches("\r\n").to_string()
    }

    /// Reads a body of `n` bytes plus its CRLF.
    async fn body(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0; n + 2];
        timeout(IO_TIMEOUT, self.r.read_exact(&mut buf))
            .await
            .expect("timed out waiting for a body")
            .unwrap();
        assert_eq!(&buf[n..], b"\r\n");
        buf.truncate(n);
        buf
    }

    async fn cmd(&mut self, line: &str) -> String {
        self.send(format!("{line}\r\n").as_bytes()).await;
        self.line().await
    }

    async fn put(&mut self, pri: u32, delay: u32, ttr: u32, body: &str) -> u32 {
        self.send(
            format!("put {pri} {delay} {ttr} {}\r\n{body}\r\n", body.len())
                .as_bytes(),
        )
        .await;
        let resp = self.line().await;
        resp.strip_prefix("INSERTED ")
            .unwrap_or_else(|| panic!("unexpected put response {resp:?}"))
            .parse()
            .unwrap()
    }

    /// Reads a `RESERVED <id> <n>` response and its body.
    async fn reserved(&mut self) -> (u32, String) {
        let resp = self.line().await;
        let mut parts = resp.split(' ');
        assert_eq!(parts.next(), Some("RESERVED"), "got {resp:?}");
        let id = parts.next().unwrap().parse().unwrap();
        let n = parts.next().unwrap().parse().unwrap();
        let body = String::from_utf8(self.body(n).await).unwrap();
        (id, body)
    }

    /// Reads an `OK <n>` response and its YAML body.
    async fn ok_yaml(&mut self) -> String {
        let resp = self.line().await;
        let n = resp
            .strip_prefix("OK ")
            .unwrap_or_else(|| panic!("unexpected response {resp:?}"))
            .parse()
            .unwrap();
        String::from_utf8(self.body(n).await).unwrap()
    }
}

#[tokio::test]
async fn test_put_reserve_delete() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut c = server.client().await;

    let id = c.put(10, 0, 60, "x").await;
    c.send(b"reserve\r\n").await;
    assert_eq!(c.reserved().await, (id, "x".to_string()));

    assert_eq!(c.cmd(&format!("delete {id}")).await, "DELETED");
    assert_eq!(c.cmd(&format!("delete {id}")).await, "NOT_FOUND");
}

#[tokio::test]
async fn test_bad_requests_keep_connection_open() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut c = server.client().await;

    assert_eq!(c.cmd("bogus").await, "UNKNOWN_COMMAND");
    assert_eq!(c.cmd("put -1 0 0 1").await, "BAD_FORMAT");
    assert_eq!(c.cmd("delete 4294967296").await, "BAD_FORMAT");
    assert_eq!(c.cmd("use -leading-dash").await, "BAD_FORMAT");
    assert_eq!(c.cmd("list-tube-used").await, "USING default");
}

#[tokio::test]
async fn test_put_body_checks() {
    let server = TestServer::start(BrokerConfig { max_job_size: 10 }).await;
    let mut c = server.client().await;

    c.send(b"put 0 0 60 3\r\nabcXY").await;
    assert_eq!(c.line().await, "EXPECTED_CRLF");

    c.send(b"put 0 0 60 20\r\n01234567890123456789\r\n").await;
    assert_eq!(c.line().await, "JOB_TOO_BIG");

    // Still in sync afterwards.
    assert_eq!(c.cmd("list-tube-used").await, "USING default");
    let id = c.put(0, 0, 60, "0123456789").await;
    assert_eq!(c.cmd(&format!("peek {id}")).await, format!("FOUND {id} 10"));
    assert_eq!(c.body(10).await, b"0123456789");
}

#[tokio::test]
async fn test_overlong_line_closes_connection() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut c = server.client().await;

    c.send(&[b'a'; 230]).await;
    assert_eq!(c.line().await, "BAD_FORMAT");
    assert_eq!(c.line().await, "");
}

#[tokio::test]
async fn test_overlong_line_during_reserve() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut c = server.client().await;

    c.send(b"reserve-with-timeout 5\r\n").await;
    sleep(Duration::from_millis(50)).await;
    c.send(&[b'a'; 230]).await;
    assert_eq!(c.line().await, "BAD_FORMAT");
    assert_eq!(c.line().await, "");
}

#[tokio::test]
async fn test_blocking_reserve_across_connections() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut worker = server.client().await;
    let mut producer = server.client().await;

    assert_eq!(worker.cmd("watch emails").await, "WATCHING 2");
    worker.send(b"reserve\r\n").await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(producer.cmd("use emails").await, "USING emails");
    let id = producer.put(0, 0, 60, "hello").await;

    assert_eq!(worker.reserved().await, (id, "hello".to_string()));
}

#[tokio::test]
async fn test_pipelined_request_during_reserve() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut c = server.client().await;

    c.send(b"reserve-with-timeout 1\r\nlist-tube-used\r\n").await;
    assert_eq!(c.line().await, "TIMED_OUT");
    assert_eq!(c.line().await, "USING default");
    assert_eq!(c.cmd("reserve-with-timeout 0").await, "NOT_FOUND");
}

#[tokio::test]
async fn test_disconnect_releases_reservation() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut producer = server.client().await;
    let id = producer.put(0, 0, 60, "job").await;

    let mut worker = server.client().await;
    worker.send(b"reserve\r\n").await;
    worker.reserved().await;
    drop(worker);

    let deadline = Instant::now() + IO_TIMEOUT;
    loop {
        producer.send(format!("stats-job {id}\r\n").as_bytes()).await;
        if producer.ok_yaml().await.contains("state: ready\n") {
            break;
        }
        assert!(Instant::now() < deadline, "job was never released");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_ttr_expiry_and_deadline_soon() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut a = server.client().await;
    let mut b = server.client().await;

    let id = a.put(0, 0, 2, "slow").await;
    a.send(b"reserve\r\n").await;
    assert_eq!(a.reserved().await.0, id);

    // The held job has under two seconds left, so this warns instead of
    // waiting out the timeout.
    let start = Instant::now();
    assert_eq!(a.cmd("reserve-with-timeout 5").await, "DEADLINE_SOON");
    assert!(start.elapsed() < Duration::from_secs(2));

    // Once the reservation runs out, someone else gets the job.
    b.send(b"reserve-with-timeout 5\r\n").await;
    assert_eq!(b.reserved().await.0, id);
    assert_eq!(a.cmd(&format!("touch {id}")).await, "NOT_FOUND");
    assert_eq!(b.cmd(&format!("touch {id}")).await, "TOUCHED");

    b.send(format!("stats-job {id}\r\n").as_bytes()).await;
    let stats = b.ok_yaml().await;
    assert!(stats.contains("timeouts: 1\n"), "{stats}");
    assert!(stats.contains("reserves: 2\n"), "{stats}");
}

#[tokio::test]
async fn test_bury_kick_and_stats() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut c = server.client().await;

    let id = c.put(5, 0, 60, "a").await;
    c.put(5, 30, 60, "b").await;
    c.send(b"reserve\r\n").await;
    assert_eq!(c.reserved().await.0, id);
    assert_eq!(c.cmd(&format!("bury {id} 7")).await, "BURIED");

    assert_eq!(c.cmd("kick 10").await, "KICKED 1");
    assert_eq!(c.cmd("kick 10").await, "KICKED 1");
    assert_eq!(c.cmd("kick 10").await, "KICKED 0");

    c.send(b"stats-tube default\r\n").await;
    let stats = c.ok_yaml().await;
    assert!(stats.contains("current-jobs-ready: 2\n"), "{stats}");
    assert!(stats.contains("total-jobs: 2\n"), "{stats}");

    c.send(b"stats\r\n").await;
    let stats = c.ok_yaml().await;
    assert!(stats.contains("current-connections: 1\n"), "{stats}");
    assert!(stats.contains("cmd-kick: 3\n"), "{stats}");
    assert!(stats.contains("current-producers: 1\n"), "{stats}");

    assert_eq!(c.cmd("pause-tube default 0").await, "PAUSED");
    assert_eq!(c.cmd("reserve-with-timeout 0").await, "NOT_FOUND");
}

#[tokio::test]
async fn test_quit() {
    let server = TestServer::start(BrokerConfig::default()).await;
    let mut c = server.client().await;

    c.send(b"quit\r\n").await;
    assert_eq!(c.line().await, "");
}
