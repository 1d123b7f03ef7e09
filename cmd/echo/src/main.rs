//! Echo server on the vconn reactor
//!
//! One reactor thread, one acceptor loop. Every accepted connection gets
//! its own continuation and a single shared buffer: reads fill it, writes
//! drain it, and each direction re-enables the other as bytes move.
//!
//! ```text
//! ECHO_PORT=7777 cargo run -p vconn-echo
//! printf hello | nc 127.0.0.1 7777
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use vconn_core::{env_get, kinfo, kwarn, CoMutex};
use vconn_net::sock::{accept_on, bind_listener, listener_addr};
use vconn_net::vio::VIO_UNBOUNDED;
use vconn_net::{
    ContRef, Continuation, Dir, EventData, MioBuffer, NetEvent, NetThread, ReactorConfig,
};

/// Idle connections are dropped after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Hears `ACCEPT` for every inbound connection and wires up an `Echo`.
struct Acceptor {
    mutex: Arc<CoMutex>,
}

impl Continuation for Acceptor {
    fn mutex(&self) -> Arc<CoMutex> {
        self.mutex.clone()
    }

    fn handle_event(&self, event: NetEvent, data: EventData) {
        let vc = match (event, data) {
            (NetEvent::Accept, EventData::Vc(vc)) => vc,
            _ => return,
        };
        let echo = Arc::new(Echo {
            mutex: CoMutex::new(),
            buf: MioBuffer::new(),
        });
        if vc
            .do_io_read(
                Some(echo.clone() as ContRef),
                VIO_UNBOUNDED,
                Some(echo.buf.clone()),
            )
            .is_err()
        {
            return;
        }
        let _ = vc.do_io_write(
            Some(echo.clone() as ContRef),
            VIO_UNBOUNDED,
            Some(echo.buf.clone()),
        );
        vc.set_inactivity_timeout(IDLE_TIMEOUT);
    }
}

/// Per-connection continuation: bounce everything back.
struct Echo {
    mutex: Arc<CoMutex>,
    buf: Arc<MioBuffer>,
}

impl Continuation for Echo {
    fn mutex(&self) -> Arc<CoMutex> {
        self.mutex.clone()
    }

    fn handle_event(&self, event: NetEvent, data: EventData) {
        let vc = match data {
            EventData::Vio(vc, _) => vc,
            _ => return,
        };
        match event {
            // New input: make sure the writer runs.
            NetEvent::ReadReady => vc.reenable(Dir::Write),
            // Output drained some of the buffer: the reader may have
            // stalled on a full buffer.
            NetEvent::WriteReady => vc.reenable(Dir::Read),
            NetEvent::Eos
            | NetEvent::Error
            | NetEvent::InactivityTimeout
            | NetEvent::ActiveTimeout => {
                if event == NetEvent::Error {
                    kwarn!("connection error, lerrno {}", vc.lerrno());
                }
                vc.do_io_close(-1);
            }
            _ => {}
        }
    }
}

fn main() {
    vconn_core::kprint::init();
    let port: u16 = env_get("ECHO_PORT", 7777);
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();

    let nt = NetThread::start(ReactorConfig::default()).expect("reactor start failed");
    let nh = nt.handler();
    let lfd = bind_listener(&addr).expect("bind failed");
    kinfo!("echo listening on {}", listener_addr(lfd).unwrap());

    let acceptor: ContRef = Arc::new(Acceptor {
        mutex: CoMutex::new(),
    });
    loop {
        let fd = accept_on(lfd);
        if fd > 0 {
            nh.accept_fd(fd as i32, acceptor.clone());
        } else {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
