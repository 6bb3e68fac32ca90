// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Integration tests over real loopback sockets: single-admission accept
//! and the full guest-pipe handshake against a blocking client thread.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use emunet::adb::{AdbGuestPipe, AdbPipeService, PipeError, PipeState, PIPE_WAKE_READ};
use emunet::{AsyncSocketServer, ExitReason, Looper, LoopbackMode};

/// Drive the looper until `done` returns true or `timeout` passes.
fn pump_until(
    looper: &mut Looper,
    timeout: Duration,
    mut done: impl FnMut(&mut Looper) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done(looper) {
            return true;
        }
        if looper.run_with_timeout(Duration::from_millis(20)) == ExitReason::Empty {
            // Nothing armed right now; wait for the other threads.
            thread::sleep(Duration::from_millis(2));
        }
    }
    done(looper)
}

#[test]
fn test_single_admission_until_relisten() {
    let mut looper = Looper::new().unwrap();
    let admitted = Rc::new(Cell::new(0usize));
    let kept: Rc<RefCell<Vec<TcpStream>>> = Rc::new(RefCell::new(Vec::new()));

    let server = AsyncSocketServer::create_tcp_loopback(
        0,
        LoopbackMode::IPV4,
        {
            let admitted = admitted.clone();
            let kept = kept.clone();
            Box::new(move |_lp, stream| {
                admitted.set(admitted.get() + 1);
                kept.borrow_mut().push(stream);
                true
            })
        },
        &mut looper,
    )
    .unwrap();
    let port = server.port();

    let clients: Vec<_> = (0..2)
        .map(|_| {
            thread::spawn(move || {
                let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
                // Hold the connection until the test is over.
                thread::sleep(Duration::from_millis(300));
                drop(stream);
            })
        })
        .collect();

    // Both clients connect, but only one is admitted before the server
    // stops listening.
    assert!(pump_until(&mut looper, Duration::from_secs(5), |_| {
        admitted.get() == 1
    }));
    thread::sleep(Duration::from_millis(50));
    looper.run_with_timeout(Duration::from_millis(50));
    assert_eq!(admitted.get(), 1);
    assert!(!server.is_listening());

    // Re-arming the listener admits the second connection from the
    // backlog.
    server.start_listening(&mut looper);
    assert!(pump_until(&mut looper, Duration::from_secs(5), |_| {
        admitted.get() == 2
    }));

    for client in clients {
        client.join().unwrap();
    }
    server.close(&mut looper);
}

#[test]
fn test_declined_connection_resumes_listening() {
    let mut looper = Looper::new().unwrap();
    let seen = Rc::new(Cell::new(0usize));
    let server = AsyncSocketServer::create_tcp_loopback(
        0,
        LoopbackMode::IPV4,
        {
            let seen = seen.clone();
            Box::new(move |_lp, _stream| {
                seen.set(seen.get() + 1);
                // Decline: the stream is dropped and listening resumes.
                false
            })
        },
        &mut looper,
    )
    .unwrap();
    let port = server.port();

    let client = thread::spawn(move || {
        for _ in 0..2 {
            let _ = TcpStream::connect(("127.0.0.1", port));
            thread::sleep(Duration::from_millis(20));
        }
    });
    assert!(pump_until(&mut looper, Duration::from_secs(5), |_| {
        seen.get() >= 2
    }));
    assert!(server.is_listening());
    client.join().unwrap();
    server.close(&mut looper);
}

#[test]
fn test_guest_pipe_full_handshake_and_proxying() {
    let mut looper = Looper::new().unwrap();
    let service = AdbPipeService::new(0, &mut looper).unwrap();
    let port = service.port();

    let wake_flags = Rc::new(Cell::new(0u8));
    let pipe = service.create_pipe({
        let wake_flags = wake_flags.clone();
        Box::new(move |flags| wake_flags.set(wake_flags.get() | flags))
    });

    // Guest writes "accept": the service starts listening.
    assert_eq!(
        pipe.borrow_mut().on_guest_send(&mut looper, b"accept"),
        Ok(6)
    );
    assert_eq!(
        pipe.borrow().state(),
        PipeState::WaitingForHostAdbConnection
    );

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"hello").unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).unwrap();
        reply
    });

    // Host connects; the pipe signals a readable "ok" reply.
    assert!(pump_until(&mut looper, Duration::from_secs(5), |_| {
        pipe.borrow().state() == PipeState::SendingAcceptReplyOk
    }));
    assert_ne!(wake_flags.get() & PIPE_WAKE_READ, 0);

    let mut reply = [0u8; 2];
    assert_eq!(
        pipe.borrow_mut().on_guest_recv(&mut looper, &mut reply),
        Ok(2)
    );
    assert_eq!(&reply, b"ok");
    assert_eq!(
        pipe.borrow_mut().on_guest_send(&mut looper, b"start"),
        Ok(5)
    );
    assert_eq!(pipe.borrow().state(), PipeState::ProxyingData);

    // Proxy phase: the client's bytes reach the guest...
    let mut received = Vec::new();
    let ok = pump_until(&mut looper, Duration::from_secs(5), |lp| {
        let mut chunk = [0u8; 16];
        match pipe.borrow_mut().on_guest_recv(lp, &mut chunk) {
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(PipeError::Again) => {}
            Err(PipeError::Closed) => panic!("pipe closed during proxying"),
        }
        received == b"hello"
    });
    assert!(ok, "expected client bytes, got {:?}", received);

    // ...and the guest's bytes reach the client.
    assert_eq!(
        pipe.borrow_mut().on_guest_send(&mut looper, b"world"),
        Ok(5)
    );
    assert_eq!(&client.join().unwrap(), b"world");

    AdbGuestPipe::on_guest_close(&pipe, &mut looper);
    service.close(&mut looper);
}
