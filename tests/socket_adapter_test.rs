//! Socket adapter against a local TCP listener.

use bench_daq::adapters::{SocketAdapter, TransportChannel};
use bench_daq::error::DaqError;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

/// Serve one connection: answer `*IDN?` in two fragments, ignore everything else.
fn spawn_instrument() -> (u16, thread::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut received = Vec::new();
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            if line == "*IDN?" {
                writer.write_all(b"KEITHLEY INSTRUMENTS,").unwrap();
                writer.flush().unwrap();
                thread::sleep(Duration::from_millis(50));
                writer.write_all(b"MODEL 2281S-20-6\n").unwrap();
            }
            received.push(line);
        }
        received
    });
    (port, handle)
}

/// Serve one connection: `:MEAS:VOLT?` is answered after `volt_delay` (never, if
/// `None`), `:MEAS:CURR?` at once.
fn spawn_slow_voltmeter(volt_delay: Option<Duration>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            match line.as_str() {
                ":MEAS:VOLT?" => {
                    if let Some(delay) = volt_delay {
                        thread::sleep(delay);
                        let _ = writer.write_all(b"3.95\n");
                    }
                }
                ":MEAS:CURR?" => {
                    let _ = writer.write_all(b"1.00\n");
                }
                _ => {}
            }
        }
    });
    port
}

#[test]
fn test_late_reply_is_not_taken_by_next_query() {
    let port = spawn_slow_voltmeter(Some(Duration::from_millis(450)));
    let mut adapter =
        SocketAdapter::new("127.0.0.1", port).with_timeout(Duration::from_millis(300));
    adapter.connect().unwrap();

    let err = adapter.query(":MEAS:VOLT?").unwrap_err();
    assert!(matches!(err, DaqError::CommandTimeout { .. }));
    assert_eq!(adapter.query(":MEAS:CURR?").unwrap(), "1.00");
    assert_eq!(adapter.query(":MEAS:CURR?").unwrap(), "1.00");
}

#[test]
fn test_late_reply_buffered_while_idle_is_dropped() {
    let port = spawn_slow_voltmeter(Some(Duration::from_millis(250)));
    let mut adapter =
        SocketAdapter::new("127.0.0.1", port).with_timeout(Duration::from_millis(150));
    adapter.connect().unwrap();

    assert!(adapter.query(":MEAS:VOLT?").is_err());
    thread::sleep(Duration::from_millis(400));
    assert_eq!(adapter.query(":MEAS:CURR?").unwrap(), "1.00");
}

#[test]
fn test_missing_late_reply_does_not_stall_later_queries() {
    let port = spawn_slow_voltmeter(None);
    let timeout = Duration::from_millis(200);
    let mut adapter = SocketAdapter::new("127.0.0.1", port).with_timeout(timeout);
    adapter.connect().unwrap();

    assert!(adapter.query(":MEAS:VOLT?").is_err());
    assert_eq!(adapter.query(":MEAS:CURR?").unwrap(), "1.00");

    let start = Instant::now();
    assert_eq!(adapter.query(":MEAS:CURR?").unwrap(), "1.00");
    assert!(start.elapsed() < timeout);
}

#[test]
fn test_query_accumulates_split_reply() {
    let (port, server) = spawn_instrument();
    let mut adapter = SocketAdapter::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
    adapter.connect().unwrap();

    adapter.write("SYST:REM").unwrap();
    let idn = adapter.query("*IDN?").unwrap();
    assert_eq!(idn, "KEITHLEY INSTRUMENTS,MODEL 2281S-20-6");

    adapter.disconnect();
    assert!(!adapter.is_connected());
    assert_eq!(server.join().unwrap(), vec!["SYST:REM", "*IDN?"]);
}

#[test]
fn test_silent_instrument_times_out() {
    let (port, _server) = spawn_instrument();
    let timeout = Duration::from_millis(300);
    let mut adapter = SocketAdapter::new("127.0.0.1", port).with_timeout(timeout);
    adapter.connect().unwrap();

    let start = Instant::now();
    let err = adapter.query(":MEAS:VOLT?").unwrap_err();
    assert!(matches!(err, DaqError::CommandTimeout { .. }));
    assert!(start.elapsed() >= timeout);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_refused_connection_is_connection_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut adapter =
        SocketAdapter::new("127.0.0.1", port).with_timeout(Duration::from_millis(500));
    let err = adapter.connect().unwrap_err();
    assert!(err.is_connection());
    assert!(!adapter.is_connected());
}
