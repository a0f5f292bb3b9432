//! End-to-end shared-memory scenarios through the public surface.

#![cfg(unix)]

use std::thread;
use std::time::Duration;

use duct::{DialOptions, ListenOptions, Message, RecvOptions, SendOptions, StatusCode};

fn unique_bus(tag: &str) -> String {
    format!("duct_test_{tag}_{}", std::process::id())
}

#[test]
fn echo_roundtrip() {
    let bus = unique_bus("echo");
    let listener = duct::listen(&format!("shm://{bus}"), &ListenOptions::default()).unwrap();
    assert_eq!(listener.local_address().unwrap(), format!("shm://{bus}"));

    let server = thread::spawn(move || {
        let pipe = listener.accept().unwrap();
        let msg = pipe
            .recv(&RecvOptions {
                timeout: Duration::from_secs(5),
            })
            .unwrap();
        pipe.send(&msg, &SendOptions::default()).unwrap();
        // Hold our handles until the client has read the echo.
        thread::sleep(Duration::from_millis(200));
    });

    let pipe = duct::dial(&format!("shm://{bus}"), &DialOptions::default()).unwrap();
    pipe.send(&Message::from_string("hello"), &SendOptions::default())
        .unwrap();
    let echoed = pipe
        .recv(&RecvOptions {
            timeout: Duration::from_secs(5),
        })
        .unwrap();
    assert_eq!(echoed.data(), b"hello");

    pipe.close();
    server.join().unwrap();
}

#[test]
fn backpressure_times_out_within_ring_capacity() {
    let bus = unique_bus("bp");
    let listener = duct::listen(&format!("shm://{bus}"), &ListenOptions::default()).unwrap();

    // Keep the listener alive but never pop: the 64-slot ring must fill.
    let pipe = duct::dial(&format!("shm://{bus}"), &DialOptions::default()).unwrap();
    let opt = SendOptions {
        timeout: Duration::from_millis(50),
    };

    let mut first_timeout = None;
    for i in 0..256 {
        match pipe.send(&Message::from_string("x"), &opt) {
            Ok(()) => {}
            Err(st) => {
                assert_eq!(st.code(), StatusCode::Timeout);
                first_timeout = Some(i);
                break;
            }
        }
    }
    let first_timeout = first_timeout.expect("ring never filled");
    assert!(first_timeout < 65, "timed out at call {first_timeout}");

    pipe.close();
    drop(listener);
}

#[test]
fn ordering_is_fifo_across_ring_wraparound() {
    let bus = unique_bus("fifo");
    let listener = duct::listen(&format!("shm://{bus}"), &ListenOptions::default()).unwrap();

    let server = thread::spawn(move || {
        let pipe = listener.accept().unwrap();
        for i in 0..200u32 {
            let msg = pipe
                .recv(&RecvOptions {
                    timeout: Duration::from_secs(5),
                })
                .unwrap();
            assert_eq!(msg.data(), format!("m{i}").as_bytes());
        }
    });

    let pipe = duct::dial(&format!("shm://{bus}"), &DialOptions::default()).unwrap();
    for i in 0..200u32 {
        pipe.send(
            &Message::from_string(&format!("m{i}")),
            &SendOptions {
                timeout: Duration::from_secs(5),
            },
        )
        .unwrap();
    }
    server.join().unwrap();
    pipe.close();
}

#[cfg(target_os = "linux")]
#[test]
fn dialer_close_unlinks_named_resources() {
    let bus = unique_bus("cleanup");
    let listener = duct::listen(&format!("shm://{bus}"), &ListenOptions::default()).unwrap();

    let server = thread::spawn(move || {
        let _pipe = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let pipe = duct::dial(&format!("shm://{bus}"), &DialOptions::default()).unwrap();

    // Derive the segment file the same way the transport does.
    let hash = duct_shm::fnv1a_32(&duct_shm::sanitize_name(&bus));
    let entries: Vec<_> = std::fs::read_dir("/dev/shm")
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(&format!("{hash:08x}")))
        .collect();
    assert!(!entries.is_empty(), "expected shm objects for bus {bus}");

    pipe.close();

    let remaining: Vec<_> = std::fs::read_dir("/dev/shm")
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(&format!("{hash:08x}")))
        .collect();
    assert!(remaining.is_empty(), "leaked shm objects: {remaining:?}");

    server.join().unwrap();
}

#[test]
fn second_dial_gets_its_own_connection() {
    let bus = unique_bus("multi");
    let listener = duct::listen(&format!("shm://{bus}"), &ListenOptions::default()).unwrap();

    let server = thread::spawn(move || {
        for expected in ["first", "second"] {
            let pipe = listener.accept().unwrap();
            let msg = pipe
                .recv(&RecvOptions {
                    timeout: Duration::from_secs(5),
                })
                .unwrap();
            assert_eq!(msg.data(), expected.as_bytes());
        }
    });

    let first = duct::dial(&format!("shm://{bus}"), &DialOptions::default()).unwrap();
    first
        .send(&Message::from_string("first"), &SendOptions::default())
        .unwrap();
    thread::sleep(Duration::from_millis(100));

    let second = duct::dial(&format!("shm://{bus}"), &DialOptions::default()).unwrap();
    second
        .send(&Message::from_string("second"), &SendOptions::default())
        .unwrap();

    server.join().unwrap();
    first.close();
    second.close();
}
