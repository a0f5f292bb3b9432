//! End-to-end TCP scenarios through the public dial/listen surface.

use std::thread;
use std::time::Duration;

use duct::{DialOptions, ListenOptions, Message, RecvOptions, SendOptions, StatusCode};

#[test]
fn echo_roundtrip_then_client_close() {
    let listener = duct::listen("tcp://127.0.0.1:0", &ListenOptions::default()).unwrap();
    let uri = listener.local_address().unwrap();

    let server = thread::spawn(move || {
        let pipe = listener.accept().unwrap();
        let msg = pipe.recv(&RecvOptions::default()).unwrap();
        pipe.send(&msg, &SendOptions::default()).unwrap();

        // After the client closes, the next recv reports Closed.
        let err = pipe.recv(&RecvOptions::default()).unwrap_err();
        assert_eq!(err.code(), StatusCode::Closed);
    });

    let pipe = duct::dial(&uri, &DialOptions::default()).unwrap();
    pipe.send(&Message::from_string("hello"), &SendOptions::default())
        .unwrap();
    let echoed = pipe
        .recv(&RecvOptions {
            timeout: Duration::from_secs(5),
        })
        .unwrap();
    assert_eq!(echoed.data(), b"hello");
    assert_eq!(echoed.len(), 5);

    pipe.close();
    server.join().unwrap();
}

#[test]
fn bare_host_port_dials_tcp() {
    let listener = duct::listen("tcp://127.0.0.1:0", &ListenOptions::default()).unwrap();
    let uri = listener.local_address().unwrap();
    let bare = uri.strip_prefix("tcp://").unwrap().to_string();

    let server = thread::spawn(move || {
        let pipe = listener.accept().unwrap();
        let msg = pipe.recv(&RecvOptions::default()).unwrap();
        pipe.send(&msg, &SendOptions::default()).unwrap();
    });

    let pipe = duct::dial(&bare, &DialOptions::default()).unwrap();
    pipe.send(&Message::from_string("no scheme"), &SendOptions::default())
        .unwrap();
    assert_eq!(
        pipe.recv(&RecvOptions::default()).unwrap().data(),
        b"no scheme"
    );
    server.join().unwrap();
}

#[test]
fn many_frames_in_order_both_directions() {
    let listener = duct::listen("tcp://127.0.0.1:0", &ListenOptions::default()).unwrap();
    let uri = listener.local_address().unwrap();

    let server = thread::spawn(move || {
        let pipe = listener.accept().unwrap();
        for _ in 0..100 {
            let msg = pipe.recv(&RecvOptions::default()).unwrap();
            pipe.send(&msg, &SendOptions::default()).unwrap();
        }
    });

    let pipe = duct::dial(&uri, &DialOptions::default()).unwrap();
    for i in 0..100u32 {
        let body = format!("frame-{i}");
        pipe.send(&Message::from_string(&body), &SendOptions::default())
            .unwrap();
        let echoed = pipe.recv(&RecvOptions::default()).unwrap();
        assert_eq!(echoed.data(), body.as_bytes());
    }
    server.join().unwrap();
}

#[test]
fn payload_sizes_up_to_the_frame_maximum() {
    let listener = duct::listen("tcp://127.0.0.1:0", &ListenOptions::default()).unwrap();
    let uri = listener.local_address().unwrap();
    let sizes = [0usize, 1, 1024, 65_536];

    let server = thread::spawn(move || {
        let pipe = listener.accept().unwrap();
        for _ in 0..4 {
            let msg = pipe.recv(&RecvOptions::default()).unwrap();
            pipe.send(&msg, &SendOptions::default()).unwrap();
        }
    });

    let pipe = duct::dial(&uri, &DialOptions::default()).unwrap();
    for size in sizes {
        let body: Vec<u8> = (0..size).map(|i| i as u8).collect();
        let msg = Message::from_vec(body.clone());
        pipe.send(&msg, &SendOptions::default()).unwrap();
        assert_eq!(pipe.recv(&RecvOptions::default()).unwrap().data(), &body);
    }

    // One byte past the frame maximum is the caller's fault.
    let err = pipe
        .send(
            &Message::from_vec(vec![0u8; 65_537]),
            &SendOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    server.join().unwrap();
}

#[test]
fn dial_nobody_listening_fails() {
    // Bind then immediately close to get a port with no listener.
    let listener = duct::listen("tcp://127.0.0.1:0", &ListenOptions::default()).unwrap();
    let uri = listener.local_address().unwrap();
    listener.close();
    drop(listener);

    let opt = DialOptions {
        timeout: Duration::from_secs(1),
        ..DialOptions::default()
    };
    let err = match duct::dial(&uri, &opt) {
        Err(e) => e,
        Ok(_) => panic!("expected dial to fail"),
    };
    assert_eq!(err.code(), StatusCode::IoError);
}
