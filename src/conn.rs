//! Per-connection HTTP/1.x parse-and-respond state machine.
//!
//! A connection owns its channel and descriptor and lives on exactly one
//! event loop. The read handler drains the socket, then cascades through
//! the parse states in a single invocation until it needs more bytes,
//! finishes a request, or errors. The post-event handler re-registers
//! interest and re-arms the eviction timer after every dispatch; a request
//! finishing with bytes left in the inbound buffer immediately re-enters
//! the request-line state (HTTP pipelining).

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::mime;
use crate::poller::{EPOLLET, EPOLLIN, EPOLLONESHOT, EPOLLOUT};
use crate::timer::TimerNode;
use crate::util;
use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

/// Interest mask for a freshly registered connection.
const DEFAULT_EVENT: u32 = EPOLLIN | EPOLLET | EPOLLONESHOT;
/// Eviction timeout for plain connections, in milliseconds.
const DEFAULT_EXPIRED_TIME: i64 = 2000;
/// Eviction timeout for keep-alive connections: 5 minutes, in milliseconds.
const DEFAULT_KEEP_ALIVE_TIME: i64 = 5 * 60 * 1000;

const SERVER_NAME: &str = "evhttpd";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Method {
    Get,
    Post,
    Head,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HttpVersion {
    V10,
    V11,
}

impl HttpVersion {
    fn as_str(self) -> &'static str {
        match self {
            HttpVersion::V10 => "1.0",
            HttpVersion::V11 => "1.1",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnectionState {
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ProcessState {
    ParseRequestLine,
    ParseHeaders,
    RecvBody,
    Analyze,
    Finish,
}

/// Character-driven sub-machine for header lines.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum HeaderParseState {
    Start,
    Key,
    Colon,
    SpacesAfterColon,
    Value,
    Cr,
    Lf,
    EndCr,
    EndLf,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ParseOutcome {
    Again,
    Error,
    Success,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AnalyseResult {
    Success,
    Error,
}

struct ConnInner {
    in_buf: BytesMut,
    out_buf: BytesMut,
    error: bool,
    conn_state: ConnectionState,
    method: Method,
    version: HttpVersion,
    state: ProcessState,
    h_state: HeaderParseState,
    path: String,
    keep_alive: bool,
    headers: HashMap<String, String>,
}

impl ConnInner {
    fn new() -> Self {
        Self {
            in_buf: BytesMut::new(),
            out_buf: BytesMut::new(),
            error: false,
            conn_state: ConnectionState::Connected,
            method: Method::Get,
            version: HttpVersion::V11,
            state: ProcessState::ParseRequestLine,
            h_state: HeaderParseState::Start,
            path: String::new(),
            keep_alive: false,
            headers: HashMap::new(),
        }
    }

    /// Parse the request line: `METHOD target HTTP/version`.
    ///
    /// Without a carriage-return in the buffer there is no complete line
    /// yet, so report `Again` without consuming anything. The target `/` or
    /// an absent target resolve to `index.html`; a query string is stripped
    /// at `?`. Only versions 1.0 and 1.1 are accepted.
    fn parse_request_line(&mut self) -> ParseOutcome {
        let cr = match self.in_buf.iter().position(|&b| b == b'\r') {
            Some(p) => p,
            None => return ParseOutcome::Again,
        };
        let request_line: Vec<u8> = self.in_buf[..cr].to_vec();
        // consume through the carriage-return; the line-feed is skipped by
        // the header sub-machine
        if self.in_buf.len() > cr + 1 {
            self.in_buf.advance(cr + 1);
        } else {
            self.in_buf.clear();
        }

        let (method_pos, method) = if let Some(p) = find_bytes(&request_line, b"GET") {
            (p, Method::Get)
        } else if let Some(p) = find_bytes(&request_line, b"POST") {
            (p, Method::Post)
        } else if let Some(p) = find_bytes(&request_line, b"HEAD") {
            (p, Method::Head)
        } else {
            return ParseOutcome::Error;
        };
        self.method = method;

        let slash = match request_line[method_pos..].iter().position(|&b| b == b'/') {
            Some(p) => method_pos + p,
            None => {
                self.path = "index.html".to_owned();
                self.version = HttpVersion::V11;
                return ParseOutcome::Success;
            }
        };
        let space = match request_line[slash..].iter().position(|&b| b == b' ') {
            Some(p) => slash + p,
            None => return ParseOutcome::Error,
        };
        if space - slash > 1 {
            let mut target = &request_line[slash + 1..space];
            if let Some(q) = target.iter().position(|&b| b == b'?') {
                target = &target[..q];
            }
            self.path = String::from_utf8_lossy(target).into_owned();
        } else {
            self.path = "index.html".to_owned();
        }

        let ver_slash = match request_line[space..].iter().position(|&b| b == b'/') {
            Some(p) => space + p,
            None => return ParseOutcome::Error,
        };
        if request_line.len() - ver_slash <= 3 {
            return ParseOutcome::Error;
        }
        self.version = match &request_line[ver_slash + 1..ver_slash + 4] {
            b"1.0" => HttpVersion::V10,
            b"1.1" => HttpVersion::V11,
            _ => return ParseOutcome::Error,
        };
        ParseOutcome::Success
    }

    /// Drive the header sub-machine over the buffered bytes.
    ///
    /// Each completed `Key: Value` pair lands in the header map, later
    /// occurrences overwriting earlier ones. Completion is the empty line;
    /// the buffer is consumed exactly through its line-feed so a pipelined
    /// request or body byte right behind it survives. On partial input the
    /// buffer is truncated to the start of the unfinished line and the
    /// sub-machine rewinds to `Start` so that line is rescanned whole.
    fn parse_headers(&mut self) -> ParseOutcome {
        let mut key_start = 0usize;
        let mut key_end = 0usize;
        let mut value_start = 0usize;
        let mut value_end = 0usize;
        let mut line_begin = 0usize;
        let mut complete_at: Option<usize> = None;
        let buf = &self.in_buf[..];
        let mut i = 0usize;
        while i < buf.len() {
            let c = buf[i];
            match self.h_state {
                HeaderParseState::Start => {
                    if c == b'\r' {
                        // the empty line may open the block: a request can
                        // carry no headers at all
                        self.h_state = HeaderParseState::EndCr;
                        line_begin = i;
                    } else if c != b'\n' {
                        self.h_state = HeaderParseState::Key;
                        key_start = i;
                        line_begin = i;
                    }
                }
                HeaderParseState::Key => {
                    if c == b':' {
                        key_end = i;
                        if key_end <= key_start {
                            return ParseOutcome::Error;
                        }
                        self.h_state = HeaderParseState::Colon;
                    } else if c == b'\n' || c == b'\r' {
                        return ParseOutcome::Error;
                    }
                }
                HeaderParseState::Colon => {
                    if c == b' ' {
                        self.h_state = HeaderParseState::SpacesAfterColon;
                    } else {
                        return ParseOutcome::Error;
                    }
                }
                HeaderParseState::SpacesAfterColon => {
                    self.h_state = HeaderParseState::Value;
                    value_start = i;
                }
                HeaderParseState::Value => {
                    if c == b'\r' {
                        value_end = i;
                        if value_end <= value_start {
                            return ParseOutcome::Error;
                        }
                        self.h_state = HeaderParseState::Cr;
                    } else if i - value_start > 255 {
                        return ParseOutcome::Error;
                    }
                }
                HeaderParseState::Cr => {
                    if c == b'\n' {
                        self.h_state = HeaderParseState::Lf;
                        let key = String::from_utf8_lossy(&buf[key_start..key_end]).into_owned();
                        let value =
                            String::from_utf8_lossy(&buf[value_start..value_end]).into_owned();
                        self.headers.insert(key, value);
                        line_begin = i;
                    } else {
                        return ParseOutcome::Error;
                    }
                }
                HeaderParseState::Lf => {
                    if c == b'\r' {
                        self.h_state = HeaderParseState::EndCr;
                    } else {
                        self.h_state = HeaderParseState::Key;
                        key_start = i;
                        line_begin = i;
                    }
                }
                HeaderParseState::EndCr => {
                    if c == b'\n' {
                        self.h_state = HeaderParseState::EndLf;
                        complete_at = Some(i + 1);
                        break;
                    }
                    return ParseOutcome::Error;
                }
                HeaderParseState::EndLf => break,
            }
            i += 1;
        }
        if let Some(end) = complete_at {
            self.in_buf.advance(end);
            return ParseOutcome::Success;
        }
        self.in_buf.advance(line_begin);
        self.h_state = HeaderParseState::Start;
        ParseOutcome::Again
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// One HTTP connection: owned channel, owned descriptor, parser state and
/// buffers. The descriptor is closed when the last strong reference drops;
/// strong references live in the poller registries and the current timer
/// node.
pub struct HttpConn {
    event_loop: Weak<EventLoop>,
    channel: Rc<Channel>,
    fd: RawFd,
    inner: RefCell<ConnInner>,
    timer: RefCell<Weak<TimerNode>>,
    self_weak: Weak<HttpConn>,
}

impl HttpConn {
    pub fn new(event_loop: &Rc<EventLoop>, fd: RawFd) -> Rc<HttpConn> {
        let conn = Rc::new_cyclic(|weak: &Weak<HttpConn>| HttpConn {
            event_loop: Rc::downgrade(event_loop),
            channel: Rc::new(Channel::new(fd)),
            fd,
            inner: RefCell::new(ConnInner::new()),
            timer: RefCell::new(Weak::new()),
            self_weak: weak.clone(),
        });
        conn.channel.set_holder(conn.self_weak.clone());
        let w = conn.self_weak.clone();
        conn.channel.set_read_handler(Box::new(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_read();
            }
        }));
        let w = conn.self_weak.clone();
        conn.channel.set_write_handler(Box::new(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_write();
            }
        }));
        let w = conn.self_weak.clone();
        conn.channel.set_error_handler(Box::new(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_error_event();
            }
        }));
        let w = conn.self_weak.clone();
        conn.channel.set_conn_handler(Box::new(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_conn();
            }
        }));
        conn
    }

    /// First registration of a fresh connection, run on its owning loop.
    pub fn new_event(&self) {
        self.channel.set_events(DEFAULT_EVENT);
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.add_to_poller(&self.channel, DEFAULT_EXPIRED_TIME);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().conn_state == ConnectionState::Disconnected
    }

    pub fn link_timer(&self, node: Weak<TimerNode>) {
        *self.timer.borrow_mut() = node;
    }

    /// Tombstone the current timer node, if any. The heap sweeps it later.
    pub fn detach_timer(&self) {
        let mut timer = self.timer.borrow_mut();
        if let Some(node) = timer.upgrade() {
            node.cancel();
        }
        *timer = Weak::new();
    }

    /// Read-ready: drain the socket, then run the parse states as far as
    /// the buffered bytes allow. Restarts from the top after a finished
    /// request when more buffered bytes remain (pipelining).
    fn handle_read(&self) {
        loop {
            let mut rerun = false;
            {
                let mut inner = self.inner.borrow_mut();
                'parse: {
                    let mut peer_closed = false;
                    let read_result = util::read_fd(self.fd, &mut inner.in_buf, &mut peer_closed);
                    if inner.conn_state == ConnectionState::Disconnecting {
                        inner.in_buf.clear();
                        break 'parse;
                    }
                    let read_num = match read_result {
                        Ok(n) => n,
                        Err(err) => {
                            warn!("read failed on fd {}: {err}", self.fd);
                            inner.error = true;
                            self.handle_error(400, "Bad Request");
                            break 'parse;
                        }
                    };
                    trace!("fd {}: {} request bytes buffered", self.fd, inner.in_buf.len());
                    if peer_closed {
                        // nothing more will arrive; flush what is parseable,
                        // then tear down
                        inner.conn_state = ConnectionState::Disconnecting;
                        if read_num == 0 {
                            break 'parse;
                        }
                    }

                    if inner.state == ProcessState::ParseRequestLine {
                        match inner.parse_request_line() {
                            ParseOutcome::Again => break 'parse,
                            ParseOutcome::Error => {
                                debug!("fd {}: malformed request line", self.fd);
                                inner.in_buf.clear();
                                inner.error = true;
                                self.handle_error(400, "Bad Request");
                                break 'parse;
                            }
                            ParseOutcome::Success => {
                                debug!(
                                    "fd {}: {:?} {} HTTP/{}",
                                    self.fd,
                                    inner.method,
                                    inner.path,
                                    inner.version.as_str()
                                );
                                inner.state = ProcessState::ParseHeaders;
                            }
                        }
                    }

                    if inner.state == ProcessState::ParseHeaders {
                        match inner.parse_headers() {
                            ParseOutcome::Again => break 'parse,
                            ParseOutcome::Error => {
                                debug!("fd {}: malformed headers", self.fd);
                                inner.error = true;
                                self.handle_error(400, "Bad Request");
                                break 'parse;
                            }
                            ParseOutcome::Success => {
                                inner.state = if inner.method == Method::Post {
                                    ProcessState::RecvBody
                                } else {
                                    ProcessState::Analyze
                                };
                            }
                        }
                    }

                    if inner.state == ProcessState::RecvBody {
                        let content_length = inner
                            .headers
                            .get("Content-length")
                            .and_then(|v| v.parse::<usize>().ok());
                        let content_length = match content_length {
                            Some(n) => n,
                            None => {
                                inner.error = true;
                                self.handle_error(
                                    400,
                                    "Bad Request: Lack of argument (Content-length)",
                                );
                                break 'parse;
                            }
                        };
                        if inner.in_buf.len() < content_length {
                            break 'parse;
                        }
                        inner.state = ProcessState::Analyze;
                    }

                    if inner.state == ProcessState::Analyze {
                        match self.analyse_request(&mut inner) {
                            AnalyseResult::Success => {
                                inner.state = ProcessState::Finish;
                                break 'parse;
                            }
                            AnalyseResult::Error => {
                                inner.error = true;
                                break 'parse;
                            }
                        }
                    }
                }

                if !inner.error {
                    if !inner.out_buf.is_empty() {
                        self.write_out(&mut inner);
                    }
                    if !inner.error && inner.state == ProcessState::Finish {
                        self.reset(&mut inner);
                        if !inner.in_buf.is_empty()
                            && inner.conn_state != ConnectionState::Disconnecting
                        {
                            rerun = true;
                        }
                    } else if !inner.error && inner.conn_state != ConnectionState::Disconnected {
                        self.channel.or_events(EPOLLIN);
                    }
                }
            }
            if !rerun {
                break;
            }
        }
    }

    /// Write-ready: flush the outbound buffer; keep write interest while
    /// bytes remain.
    fn handle_write(&self) {
        let mut inner = self.inner.borrow_mut();
        self.write_out(&mut inner);
    }

    fn write_out(&self, inner: &mut ConnInner) {
        if !inner.error && inner.conn_state != ConnectionState::Disconnected {
            if let Err(err) = util::write_fd(self.fd, &mut inner.out_buf) {
                warn!("write failed on fd {}: {err}", self.fd);
                self.channel.set_events(0);
                inner.error = true;
            }
            if !inner.out_buf.is_empty() {
                self.channel.or_events(EPOLLOUT);
            }
        }
    }

    /// Post-event handler: detach the spent timer, then re-register
    /// whatever interest the read/write handlers left behind.
    ///
    /// With both read and write interest pending, interest narrows to write
    /// so buffered output flushes before more input is accepted. A
    /// keep-alive connection with no pending interest waits for the next
    /// request under the 5-minute window; one without keep-alive gets half
    /// that. No interest, no keep-alive path still re-arms reads because a
    /// pipelined peer may already have bytes in flight. Anything else —
    /// error, or a draining connection with nothing left to write — closes.
    fn handle_conn(&self) {
        self.detach_timer();
        let (error, conn_state, keep_alive) = {
            let inner = self.inner.borrow();
            (inner.error, inner.conn_state, inner.keep_alive)
        };
        let event_loop = match self.event_loop.upgrade() {
            Some(event_loop) => event_loop,
            None => return,
        };
        let mut events = self.channel.events();
        if !error && conn_state == ConnectionState::Connected {
            if events != 0 {
                let timeout = if keep_alive {
                    DEFAULT_KEEP_ALIVE_TIME
                } else {
                    DEFAULT_EXPIRED_TIME
                };
                if (events & EPOLLIN) != 0 && (events & EPOLLOUT) != 0 {
                    events = EPOLLOUT;
                }
                events |= EPOLLET;
                self.channel.set_events(events);
                event_loop.update_poller(&self.channel, timeout);
            } else if keep_alive {
                self.channel.set_events(events | EPOLLIN | EPOLLET);
                event_loop.update_poller(&self.channel, DEFAULT_KEEP_ALIVE_TIME);
            } else {
                self.channel.set_events(events | EPOLLIN | EPOLLET);
                event_loop.update_poller(&self.channel, DEFAULT_KEEP_ALIVE_TIME / 2);
            }
        } else if !error
            && conn_state == ConnectionState::Disconnecting
            && (events & EPOLLOUT) != 0
        {
            self.channel.set_events(EPOLLOUT | EPOLLET);
        } else {
            self.handle_close();
        }
    }

    fn handle_error_event(&self) {
        warn!("socket error on fd {}", self.fd);
        self.inner.borrow_mut().error = true;
        self.handle_close();
    }

    /// Unregister and let the reference counts run out; the descriptor
    /// closes with the last strong reference.
    pub fn handle_close(&self) {
        self.inner.borrow_mut().conn_state = ConnectionState::Disconnected;
        // hold a guard so dropping the registry references cannot free us
        // mid-call
        let guard = self.self_weak.upgrade();
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_from_poller(&self.channel);
        }
        drop(guard);
    }

    /// Rewind the parser for the next request on this connection. The
    /// inbound buffer is kept: it may already hold pipelined bytes. The
    /// keep-alive flag survives.
    fn reset(&self, inner: &mut ConnInner) {
        inner.path.clear();
        inner.state = ProcessState::ParseRequestLine;
        inner.h_state = HeaderParseState::Start;
        inner.headers.clear();
        self.detach_timer();
    }

    /// Compose the response for a parsed request.
    fn analyse_request(&self, inner: &mut ConnInner) -> AnalyseResult {
        match inner.method {
            // no POST handler is wired up; buffered bodies are dropped and
            // the connection torn down
            Method::Post => AnalyseResult::Error,
            Method::Get | Method::Head => {
                let mut header = String::new();
                header.push_str("HTTP/1.1 200 OK\r\n");
                if let Some(value) = inner.headers.get("Connection") {
                    if value == "Keep-Alive" || value == "keep-alive" {
                        inner.keep_alive = true;
                        header.push_str(&format!(
                            "Connection: Keep-Alive\r\nKeep-Alive: timeout={DEFAULT_KEEP_ALIVE_TIME}\r\n"
                        ));
                    }
                }
                let file_type = match inner.path.rfind('.') {
                    Some(dot) => mime::mime_type(&inner.path[dot..]),
                    None => mime::mime_type(""),
                };

                if inner.path == "hello" {
                    inner.out_buf.clear();
                    inner.out_buf.extend_from_slice(
                        b"HTTP/1.1 200 OK\r\nContent-type: text/plain\r\n\r\nHello World",
                    );
                    return AnalyseResult::Success;
                }
                if inner.path == "favicon.ico" {
                    header.push_str("Content-Type: image/png\r\n");
                    header.push_str(&format!("Content-Length: {}\r\n", mime::FAVICON.len()));
                    header.push_str(&format!("Server: {SERVER_NAME}\r\n"));
                    header.push_str("\r\n");
                    inner.out_buf.extend_from_slice(header.as_bytes());
                    if inner.method != Method::Head {
                        inner.out_buf.extend_from_slice(&mime::FAVICON);
                    }
                    return AnalyseResult::Success;
                }

                let cpath = match CString::new(inner.path.as_str()) {
                    Ok(p) => p,
                    Err(_) => {
                        self.handle_error(404, "Not Found!");
                        return AnalyseResult::Error;
                    }
                };
                let mut st: libc::stat = unsafe { std::mem::zeroed() };
                if unsafe { libc::stat(cpath.as_ptr(), &mut st) } < 0 {
                    self.handle_error(404, "Not Found!");
                    return AnalyseResult::Error;
                }
                if (st.st_mode & libc::S_IFMT) != libc::S_IFREG {
                    self.handle_error(404, "Not Found!");
                    return AnalyseResult::Error;
                }
                header.push_str(&format!("Content-Type: {file_type}\r\n"));
                header.push_str(&format!("Content-Length: {}\r\n", st.st_size));
                header.push_str(&format!("Server: {SERVER_NAME}\r\n"));
                header.push_str("\r\n");
                inner.out_buf.extend_from_slice(header.as_bytes());

                if inner.method == Method::Head {
                    return AnalyseResult::Success;
                }

                let src_fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
                if src_fd < 0 {
                    inner.out_buf.clear();
                    self.handle_error(404, "Not Found!");
                    return AnalyseResult::Error;
                }
                let size = st.st_size as usize;
                if size > 0 {
                    let mapped = unsafe {
                        libc::mmap(
                            std::ptr::null_mut(),
                            size,
                            libc::PROT_READ,
                            libc::MAP_PRIVATE,
                            src_fd,
                            0,
                        )
                    };
                    unsafe { libc::close(src_fd) };
                    if mapped == libc::MAP_FAILED {
                        inner.out_buf.clear();
                        self.handle_error(404, "Not Found!");
                        return AnalyseResult::Error;
                    }
                    let bytes =
                        unsafe { std::slice::from_raw_parts(mapped as *const u8, size) };
                    inner.out_buf.extend_from_slice(bytes);
                    unsafe { libc::munmap(mapped, size) };
                } else {
                    unsafe { libc::close(src_fd) };
                }
                AnalyseResult::Success
            }
        }
    }

    /// Write an error page straight to the socket, bypassing the outbound
    /// buffer. Short writes are not retried; the connection is about to be
    /// torn down anyway.
    fn handle_error(&self, err_num: u16, short_msg: &str) {
        let short_msg = format!(" {short_msg}");
        let mut body = String::new();
        body.push_str("<html><title>Oops! Something went wrong</title>");
        body.push_str("<body bgcolor=\"ffffff\">");
        body.push_str(&format!("{err_num}{short_msg}"));
        body.push_str(&format!("<hr><em> {SERVER_NAME}</em>\n</body></html>"));

        let header = format!(
            "HTTP/1.1 {err_num}{short_msg}\r\nContent-Type: text/html\r\nConnection: Close\r\nContent-Length: {}\r\nServer: {SERVER_NAME}\r\n\r\n",
            body.len()
        );
        let _ = util::write_bytes(self.fd, header.as_bytes());
        let _ = util::write_bytes(self.fd, body.as_bytes());
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        trace!("closing fd {}", self.fd);
        unsafe { libc::close(self.fd) };
    }
}
