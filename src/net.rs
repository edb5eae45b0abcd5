use crate::dispatch::Dispatcher;
use crate::errors::ReturnCode;
use crate::wire::{self, Request, Response, WireError};
use log::{error, info, warn};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const CONN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection settings handed to every handler thread.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub tcp_no_delay: bool,
    /// A request not answered within this window is failed with `Timeout`;
    /// the worker keeps running and its late result is discarded.
    pub request_timeout: Duration,
}

struct AcceptLoopState {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl AcceptLoopState {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn mark_stopped(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
        }
        self.condvar.notify_all();
    }

    fn wait_for_stop(&self, timeout: Duration) -> Result<(), NetError> {
        let guard = self
            .done
            .lock()
            .map_err(|_| NetError::Poisoned {
                context: "accept loop state",
            })?;
        if *guard {
            return Ok(());
        }
        let (next, _status) = self
            .condvar
            .wait_timeout(guard, timeout)
            .map_err(|_| NetError::Poisoned {
                context: "accept loop state",
            })?;
        if *next {
            Ok(())
        } else {
            Err(NetError::ShutdownTimeout {
                context: "accept loop",
            })
        }
    }
}

#[derive(Default)]
struct ConnectionTracker {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ConnectionTracker {
    fn track(&self, handle: thread::JoinHandle<()>) -> Result<(), NetError> {
        self.handles
            .lock()
            .map_err(|_| NetError::Poisoned {
                context: "connection tracker",
            })?
            .push(handle);
        Ok(())
    }

    fn join_all(&self) -> Result<(), NetError> {
        let mut handles = self.handles.lock().map_err(|_| NetError::Poisoned {
            context: "connection tracker",
        })?;
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }
}

/// Running server: owns the accept loop and every connection thread.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    connections: Arc<ConnectionTracker>,
    state: Arc<AcceptLoopState>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn try_shutdown(&mut self, timeout: Duration) -> Result<(), NetError> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            self.state.wait_for_stop(timeout)?;
            if handle.join().is_err() {
                warn!("event=server_accept_loop_panic");
            }
        }
        self.connections.join_all()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.try_shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}

/// Binds the listener and starts serving the binary protocol. Each accepted
/// connection gets its own thread; all request execution happens on the
/// dispatcher's workers.
pub fn serve(
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    options: ServerOptions,
) -> Result<ServerHandle, NetError> {
    let listener = TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    info!("event=server_listening addr={local_addr}");

    let shutdown = Arc::new(AtomicBool::new(false));
    let tracker = Arc::new(ConnectionTracker::default());
    let state = Arc::new(AcceptLoopState::new());

    let accept_shutdown = shutdown.clone();
    let accept_tracker = tracker.clone();
    let accept_state = state.clone();
    let join = thread::Builder::new()
        .name("bookie-accept".into())
        .spawn(move || {
            loop {
                if accept_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let dispatcher = dispatcher.clone();
                        let shutdown_token = accept_shutdown.clone();
                        let connection = thread::spawn(move || {
                            if let Err(err) =
                                serve_connection(stream, peer, dispatcher, options, shutdown_token)
                            {
                                warn!("event=connection_error peer={peer} error={err}");
                            }
                        });
                        if let Err(err) = accept_tracker.track(connection) {
                            warn!("event=connection_tracking_failed error={err}");
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_BACKOFF);
                    }
                    Err(err) => {
                        error!("event=accept_error error={err}");
                        break;
                    }
                }
            }
            accept_state.mark_stopped();
        })
        .map_err(NetError::Io)?;

    Ok(ServerHandle {
        local_addr,
        shutdown,
        join: Some(join),
        connections: tracker,
        state,
    })
}

fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    options: ServerOptions,
    shutdown: Arc<AtomicBool>,
) -> Result<(), NetError> {
    stream.set_nodelay(options.tcp_no_delay)?;
    // Short read timeouts let the handler notice shutdown between frames.
    stream.set_read_timeout(Some(CONN_POLL_INTERVAL))?;
    loop {
        let (op, body) = match read_frame_polling(&mut stream, &shutdown)? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let request = match Request::decode(op, &body) {
            Ok(request) => request,
            Err(WireError::UnknownOp { op }) => {
                warn!("event=unknown_op peer={peer} op={op}");
                let frame = Response::error(ReturnCode::IoError, 0, 0).encode(op);
                stream.write_all(&frame)?;
                continue;
            }
            Err(err) => return Err(NetError::Wire(err)),
        };
        let (tx, rx) = mpsc::channel();
        dispatcher.submit(
            request,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );
        let response = match rx.recv_timeout(options.request_timeout) {
            Ok(response) => response,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("event=request_timeout peer={peer} op={op}");
                Response::error(ReturnCode::Timeout, 0, 0)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Response::error(ReturnCode::Shutdown, 0, 0)
            }
        };
        stream.write_all(&response.encode(op))?;
        stream.flush()?;
    }
}

/// Reads one frame, treating read timeouts between frames as shutdown poll
/// points. Returns None on clean EOF or shutdown at a frame boundary.
fn read_frame_polling(
    stream: &mut TcpStream,
    shutdown: &AtomicBool,
) -> Result<Option<(u32, Vec<u8>)>, NetError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0usize;
    while filled < 4 {
        match stream.read(&mut len_buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(NetError::Io(io::ErrorKind::UnexpectedEof.into()))
                };
            }
            Ok(read) => filled += read,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                if filled == 0 && shutdown.load(Ordering::Relaxed) {
                    return Ok(None);
                }
            }
            Err(err) => return Err(NetError::Io(err)),
        }
    }
    let total_len = u32::from_be_bytes(len_buf) as usize;
    if !(4..=wire::MAX_FRAME_BYTES).contains(&total_len) {
        return Err(NetError::Wire(WireError::FrameLength { len: total_len }));
    }
    let mut rest = vec![0u8; total_len];
    read_exact_polling(stream, &mut rest)?;
    let op = u32::from_be_bytes(rest[0..4].try_into().expect("sized"));
    rest.drain(0..4);
    Ok(Some((op, rest)))
}

/// `read_exact` that retries across read timeouts mid-frame; once a frame
/// has started, shutdown waits for it to finish.
fn read_exact_polling(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), NetError> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(NetError::Io(io::ErrorKind::UnexpectedEof.into())),
            Ok(read) => filled += read,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(NetError::Io(err)),
        }
    }
    Ok(())
}

/// Minimal blocking client speaking the bookie protocol; used by tests and
/// admin tooling.
pub struct BookieClient {
    stream: TcpStream,
}

impl BookieClient {
    pub fn connect(addr: SocketAddr) -> Result<Self, NetError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn request(&mut self, request: &Request) -> Result<Response, NetError> {
        wire::write_frame(&mut self.stream, &request.encode())?;
        match wire::read_frame(&mut self.stream)? {
            Some((_op, body)) => Ok(Response::decode(&body)?),
            None => Err(NetError::Io(io::ErrorKind::UnexpectedEof.into())),
        }
    }
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("poisoned lock: {context}")]
    Poisoned { context: &'static str },
    #[error("shutdown timed out: {context}")]
    ShutdownTimeout { context: &'static str },
}
