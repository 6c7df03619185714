//! End-to-end tests driving a live server instance over localhost TCP.
//!
//! Each test binds its own port so the suite can run in parallel. The
//! server runs entirely in-process: one thread owns the main (acceptor)
//! loop, the pool owns the workers, and the returned handle shuts the whole
//! thing down at the end of the test.

use evhttpd::event_loop::{EventLoop, LoopHandle};
use evhttpd::mime::FAVICON;
use evhttpd::server::Server;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

const HELLO_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-type: text/plain\r\n\r\nHello World";

struct TestServer {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
    port: u16,
}

impl TestServer {
    fn spawn(port: u16, threads: usize) -> TestServer {
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            let main_loop = EventLoop::new();
            let server = Server::new(&main_loop, threads, port).expect("bind failed");
            server.start();
            tx.send(main_loop.handle()).unwrap();
            main_loop.run();
            drop(server); // joins the worker pool
        });
        let handle = rx.recv().unwrap();
        TestServer {
            handle,
            thread: Some(thread),
            port,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect failed");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("short response");
    buf
}

fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read to eof failed");
    buf
}

fn read_head_block(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).expect("read failed");
        assert!(n > 0, "connection closed before end of headers");
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

#[test]
fn test_hello_route() {
    let server = TestServer::spawn(18230, 2);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_exact_len(&mut stream, HELLO_RESPONSE.len());
    assert_eq!(response, HELLO_RESPONSE);
}

#[test]
fn test_missing_file_is_404() {
    let server = TestServer::spawn(18231, 2);
    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    // no index.html in the test working directory; the error path also
    // closes the connection, so reading to EOF is safe
    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 404 Not Found!\r\n"), "got: {text}");
    assert!(text.contains("404 Not Found!"));
    assert!(text.contains("evhttpd"));
}

#[test]
fn test_head_favicon_has_headers_and_no_body() {
    let server = TestServer::spawn(18232, 2);
    let mut stream = server.connect();
    stream
        .write_all(b"HEAD /favicon.ico HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let head = read_head_block(&mut stream);
    let text = String::from_utf8_lossy(&head);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Type: image/png\r\n"));
    assert!(text.contains("Content-Length: 555\r\n"));
    assert!(text.ends_with("\r\n\r\n"));

    // no body bytes may follow the header block
    stream
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut probe = [0u8; 16];
    match stream.read(&mut probe) {
        Ok(0) => {} // server closed with nothing further: fine
        Ok(n) => panic!("HEAD response carried {n} body bytes"),
        Err(err) => assert!(
            err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut,
            "unexpected error: {err}"
        ),
    }
}

#[test]
fn test_get_favicon_body_matches_blob() {
    let server = TestServer::spawn(18233, 2);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /favicon.ico HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let expected_head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nServer: evhttpd\r\n\r\n",
        FAVICON.len()
    );
    let response = read_exact_len(&mut stream, expected_head.len() + FAVICON.len());
    assert_eq!(&response[..expected_head.len()], expected_head.as_bytes());
    assert_eq!(&response[expected_head.len()..], &FAVICON[..]);
}

#[test]
fn test_pipelined_keep_alive_requests() {
    let server = TestServer::spawn(18234, 2);
    let mut stream = server.connect();
    let request = b"GET /hello HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n";
    let mut two = Vec::new();
    two.extend_from_slice(request);
    two.extend_from_slice(request);
    // both requests in a single segment
    stream.write_all(&two).unwrap();
    let response = read_exact_len(&mut stream, HELLO_RESPONSE.len() * 2);
    assert_eq!(&response[..HELLO_RESPONSE.len()], HELLO_RESPONSE);
    assert_eq!(&response[HELLO_RESPONSE.len()..], HELLO_RESPONSE);

    // the connection is still usable for a third request
    stream.write_all(request).unwrap();
    let response = read_exact_len(&mut stream, HELLO_RESPONSE.len());
    assert_eq!(response, HELLO_RESPONSE);
}

#[test]
fn test_post_without_content_length_is_400() {
    let server = TestServer::spawn(18235, 2);
    let mut stream = server.connect();
    stream.write_all(b"POST /x HTTP/1.1\r\n\r\n").unwrap();
    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(
        text.starts_with("HTTP/1.1 400 Bad Request: Lack of argument (Content-length)\r\n"),
        "got: {text}"
    );
    assert!(text.contains("400 Bad Request: Lack of argument (Content-length)"));
}

#[test]
fn test_unsupported_version_is_400() {
    let server = TestServer::spawn(18236, 2);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /x HTTP/0.9\r\n\r\n")
        .unwrap();
    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {text}");
}

#[test]
fn test_static_file_roundtrip() {
    let server = TestServer::spawn(18237, 2);
    let name = "evhttpd_itest_page.html";
    let content = b"<html><body>static body</body></html>";
    std::fs::write(name, content).unwrap();

    let mut stream = server.connect();
    stream
        .write_all(format!("GET /{name} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
        .unwrap();
    let expected_head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nServer: evhttpd\r\n\r\n",
        content.len()
    );
    let response = read_exact_len(&mut stream, expected_head.len() + content.len());
    let _ = std::fs::remove_file(name);
    assert_eq!(&response[..expected_head.len()], expected_head.as_bytes());
    assert_eq!(&response[expected_head.len()..], content);
}

#[test]
fn test_head_matches_get_headers_for_static_file() {
    let server = TestServer::spawn(18238, 2);
    let name = "evhttpd_itest_head.html";
    let content = b"<p>head vs get</p>";
    std::fs::write(name, content).unwrap();

    let mut get_stream = server.connect();
    get_stream
        .write_all(format!("GET /{name} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
        .unwrap();
    let expected_head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nServer: evhttpd\r\n\r\n",
        content.len()
    );
    let get_response =
        read_exact_len(&mut get_stream, expected_head.len() + content.len());

    let mut head_stream = server.connect();
    head_stream
        .write_all(format!("HEAD /{name} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
        .unwrap();
    let head_response = read_exact_len(&mut head_stream, expected_head.len());
    let _ = std::fs::remove_file(name);

    assert_eq!(&get_response[..expected_head.len()], &head_response[..]);
    assert_eq!(&get_response[expected_head.len()..], content);
}

#[test]
fn test_idle_connection_is_evicted() {
    // single worker so both connections share one loop and one timer heap
    let server = TestServer::spawn(18239, 1);
    let mut idle = server.connect();

    // outlive the 2-second idle window, then poke the loop with a second
    // connection so the reap pass runs
    std::thread::sleep(Duration::from_millis(2500));
    let mut active = server.connect();
    active
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_exact_len(&mut active, HELLO_RESPONSE.len());
    assert_eq!(response, HELLO_RESPONSE);

    // the idle connection was closed without a response
    let mut probe = [0u8; 16];
    let n = idle.read(&mut probe).expect("expected clean close");
    assert_eq!(n, 0);
}

#[test]
fn test_query_string_is_stripped() {
    let server = TestServer::spawn(18240, 2);
    let name = "evhttpd_itest_query.html";
    let content = b"<i>q</i>";
    std::fs::write(name, content).unwrap();

    let mut stream = server.connect();
    stream
        .write_all(format!("GET /{name}?q=1 HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
        .unwrap();
    let expected_head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nServer: evhttpd\r\n\r\n",
        content.len()
    );
    let response = read_exact_len(&mut stream, expected_head.len() + content.len());
    let _ = std::fs::remove_file(name);
    assert_eq!(&response[expected_head.len()..], content);
}

#[test]
fn test_keep_alive_headers_on_static_file() {
    let server = TestServer::spawn(18241, 2);
    let name = "evhttpd_itest_ka.html";
    let content = b"ka";
    std::fs::write(name, content).unwrap();

    let mut stream = server.connect();
    stream
        .write_all(
            format!("GET /{name} HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n").as_bytes(),
        )
        .unwrap();
    let expected_head = format!(
        "HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\nKeep-Alive: timeout=300000\r\nContent-Type: text/html\r\nContent-Length: {}\r\nServer: evhttpd\r\n\r\n",
        content.len()
    );
    let response = read_exact_len(&mut stream, expected_head.len() + content.len());
    let _ = std::fs::remove_file(name);
    assert_eq!(&response[..expected_head.len()], expected_head.as_bytes());

    // body length equals the advertised Content-Length
    assert_eq!(response.len() - expected_head.len(), content.len());
}
