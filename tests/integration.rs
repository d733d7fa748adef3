//! Integration tests for instrument-relay.
//!
//! These run a real server on a loopback port with the simulated driver and
//! talk to it through the client.

use std::time::Duration;

use serde_json::json;
use tokio::net::TcpStream;

use instrument_relay::driver::{Attribute, DriverError, SimulatedDriver, SimulatedInstrument};
use instrument_relay::protocol::{build_frame, Command, Response};
use instrument_relay::transport::FramedConnection;
use instrument_relay::{Client, Error, InstrumentHandle, RemoteErrorKind, Server};

const SCOPE: &str = "TCPIP::1.2.3.4::INSTR";
const DMM: &str = "GPIB0::22::INSTR";

fn lab_driver() -> SimulatedDriver {
    SimulatedDriver::new()
        .with_resource(
            SCOPE,
            SimulatedInstrument::new()
                .reply("*IDN?", "FakeInstrument,Model1")
                .reply("CURV?", vec![0x00u8, 0x3a, 0xff, 0x10])
                .reply("MEAS:FREQ?", "1.000E+06")
                .fail("*TRG", DriverError::io("VI_ERROR_TMO (-1073807339): Timeout expired")),
        )
        .with_resource(
            DMM,
            SimulatedInstrument::new()
                .reply("MEAS:VOLT?", "+1.234E+00")
                .attribute(Attribute::Lock, json!("none")),
        )
}

/// Start a server on an ephemeral port and return its address.
async fn start_server(driver: SimulatedDriver) -> String {
    let server = Server::builder()
        .bind_address("127.0.0.1:0")
        .bind(driver)
        .await
        .unwrap();
    let address = server.local_addr().unwrap().to_string();
    tokio::spawn(server.run());
    address
}

/// Poll until the driver reports `expected` open sessions.
async fn wait_for_sessions(driver: &SimulatedDriver, expected: usize) {
    for _ in 0..100 {
        if driver.open_sessions() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} open sessions, found {}",
        expected,
        driver.open_sessions()
    );
}

#[tokio::test]
async fn test_open_ask_attribute_close_scenario() {
    let address = start_server(lab_driver()).await;
    let mut client = Client::new(address);

    let h = client.open(SCOPE).await.unwrap();
    assert_eq!(h, InstrumentHandle(0));

    let idn = client.ask(h, "*IDN?").await.unwrap();
    assert_eq!(&idn[..], b"FakeInstrument,Model1");

    client.set_attribute(h, "timeout", &5000).await.unwrap();
    assert_eq!(client.get_attribute(h, "timeout").await.unwrap(), json!(5000));

    client.close(h).await.unwrap();

    match client.read_raw(h).await {
        Err(Error::UnknownHandle(0)) => {}
        other => panic!("expected UnknownHandle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_list_instruments() {
    let address = start_server(lab_driver()).await;
    let mut client = Client::new(address);

    let mut names = client.list_instruments().await.unwrap();
    names.sort();
    assert_eq!(names, vec![DMM.to_string(), SCOPE.to_string()]);
}

#[tokio::test]
async fn test_list_instruments_empty() {
    let address = start_server(SimulatedDriver::new()).await;
    let mut client = Client::new(address);

    assert!(client.list_instruments().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_driver_failure_keeps_connection() {
    let address = start_server(lab_driver()).await;
    let mut client = Client::new(address);

    let scope = client.open(SCOPE).await.unwrap();
    let dmm = client.open(DMM).await.unwrap();
    assert_eq!(dmm, InstrumentHandle(1));

    match client.write_raw(scope, "*TRG").await {
        Err(Error::Instrument { kind, message }) => {
            assert_eq!(kind, RemoteErrorKind::VisaIOError);
            assert!(message.contains("Timeout expired"));
        }
        other => panic!("expected instrument error, got {other:?}"),
    }
    assert!(client.is_connected());

    let reading = client.ask(dmm, "MEAS:VOLT?").await.unwrap();
    assert_eq!(&reading[..], b"+1.234E+00");
}

#[tokio::test]
async fn test_open_unknown_resource() {
    let address = start_server(lab_driver()).await;
    let mut client = Client::new(address);

    match client.open("ASRL3::INSTR").await {
        Err(Error::Instrument { kind, .. }) => assert_eq!(kind, RemoteErrorKind::VisaIOError),
        other => panic!("expected instrument error, got {other:?}"),
    }

    // The failed open consumed no handle
    assert_eq!(client.open(DMM).await.unwrap(), InstrumentHandle(0));
}

#[tokio::test]
async fn test_binary_write_read() {
    let address = start_server(lab_driver()).await;
    let mut client = Client::new(address);
    let h = client.open(SCOPE).await.unwrap();

    client.write(h, "CURV?\n").await.unwrap();
    let data = client.read_raw(h).await.unwrap();
    assert_eq!(&data[..], &[0x00, 0x3a, 0xff, 0x10]);

    client.write(h, "*IDN?").await.unwrap();
    assert_eq!(client.read(h).await.unwrap(), "FakeInstrument,Model1");
}

#[tokio::test]
async fn test_clear_discards_pending_reply() {
    let address = start_server(lab_driver()).await;
    let mut client = Client::new(address);
    let h = client.open(SCOPE).await.unwrap();

    client.write(h, "*IDN?").await.unwrap();
    client.clear(h).await.unwrap();
    assert!(matches!(
        client.read_raw(h).await,
        Err(Error::Instrument { .. })
    ));
}

#[tokio::test]
async fn test_attributes() {
    let address = start_server(lab_driver()).await;
    let mut client = Client::new(address);
    let scope = client.open(SCOPE).await.unwrap();
    let dmm = client.open(DMM).await.unwrap();

    assert_eq!(client.get_attribute(dmm, "lock").await.unwrap(), json!("none"));
    assert_eq!(client.get_attribute(scope, "send_end").await.unwrap(), json!(true));

    // Allowed name the scope does not have
    assert!(matches!(
        client.get_attribute(scope, "lock").await,
        Err(Error::UnknownAttribute(ref name)) if name == "lock"
    ));

    // Rejected before reaching the server
    assert!(matches!(
        client.get_attribute(scope, "visalib").await,
        Err(Error::UnknownAttribute(_))
    ));

    client
        .set_attribute(scope, "term_chars", &"\n")
        .await
        .unwrap();
    assert_eq!(
        client.get_attribute(scope, "term_chars").await.unwrap(),
        json!("\n")
    );
}

#[tokio::test]
async fn test_cancelled_call_does_not_leak_reply() {
    let address = start_server(lab_driver()).await;
    let mut client = Client::new(address);
    let h = client.open(SCOPE).await.unwrap();

    // The request is written on the first poll, then the call is dropped
    // while its reply is still in flight.
    tokio::select! {
        biased;
        _ = client.ask(h, "*IDN?") => panic!("ask completed without the server"),
        _ = std::future::ready(()) => {}
    }
    assert!(!client.is_connected());

    // The reconnect starts a fresh handle table
    let h = client.open(SCOPE).await.unwrap();
    assert_eq!(h, InstrumentHandle(0));
    let freq = client.ask(h, "MEAS:FREQ?").await.unwrap();
    assert_eq!(&freq[..], b"1.000E+06");
    let idn = client.ask(h, "*IDN?").await.unwrap();
    assert_eq!(&idn[..], b"FakeInstrument,Model1");
}

#[tokio::test]
async fn test_close_twice_and_out_of_range() {
    let address = start_server(lab_driver()).await;
    let mut client = Client::new(address);
    let h = client.open(SCOPE).await.unwrap();

    client.close(h).await.unwrap();
    client.close(h).await.unwrap();

    assert!(matches!(
        client.close(InstrumentHandle(9)).await,
        Err(Error::UnknownHandle(9))
    ));
}

#[tokio::test]
async fn test_connections_have_independent_handles() {
    let address = start_server(lab_driver()).await;
    let mut first = Client::new(address.clone());
    let mut second = Client::new(address);

    assert_eq!(first.open(SCOPE).await.unwrap(), InstrumentHandle(0));
    assert_eq!(first.open(DMM).await.unwrap(), InstrumentHandle(1));
    assert_eq!(second.open(DMM).await.unwrap(), InstrumentHandle(0));

    // Handle 1 exists only on the first connection
    assert!(matches!(
        second.ask(InstrumentHandle(1), "*IDN?").await,
        Err(Error::UnknownHandle(1))
    ));
}

#[tokio::test]
async fn test_disconnect_closes_instruments() {
    let driver = lab_driver();
    let address = start_server(driver.clone()).await;
    let mut client = Client::new(address);

    client.open(SCOPE).await.unwrap();
    client.open(DMM).await.unwrap();
    assert_eq!(driver.open_sessions(), 2);

    client.disconnect().await;
    assert!(!client.is_connected());
    wait_for_sessions(&driver, 0).await;

    // Reconnecting starts a fresh handle sequence
    assert_eq!(client.open(DMM).await.unwrap(), InstrumentHandle(0));
}

#[tokio::test]
async fn test_malformed_command_drops_only_that_connection() {
    let driver = lab_driver();
    let address = start_server(driver.clone()).await;

    let stream = TcpStream::connect(&address).await.unwrap();
    let mut raw = FramedConnection::new(stream);
    let open = Command::open(&json!({ "visa_address": SCOPE })).unwrap();
    raw.send(&open.encode().unwrap()).await.unwrap();
    let reply = Response::decode(&raw.receive().await.unwrap()).unwrap();
    assert_eq!(reply, Response::Success(bytes::Bytes::from_static(b"0")));

    // Non-decimal handle is a protocol error
    raw.send(b"A:zero:*IDN?").await.unwrap();
    assert!(matches!(raw.receive().await, Err(Error::ConnectionClosed)));
    wait_for_sessions(&driver, 0).await;

    // The server keeps serving other clients
    let mut client = Client::new(address);
    let h = client.open(SCOPE).await.unwrap();
    assert_eq!(&client.ask(h, "*IDN?").await.unwrap()[..], b"FakeInstrument,Model1");
}

#[tokio::test]
async fn test_raw_frame_bytes_on_the_wire() {
    let address = start_server(lab_driver()).await;
    let stream = TcpStream::connect(&address).await.unwrap();
    let mut raw = FramedConnection::new(stream);

    raw.send(b"G:").await.unwrap();
    let reply = raw.receive().await.unwrap();
    assert!(reply.starts_with(b"+"));

    assert_eq!(build_frame(b"G:").unwrap(), vec![0, 0, 0, 2, b'G', b':']);
}

#[tokio::test]
async fn test_server_unreachable() {
    // Bind then drop to get a port with nothing listening
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut client = Client::builder()
        .address(address.clone())
        .connect_timeout(Duration::from_millis(500))
        .build();

    match client.list_instruments().await {
        Err(Error::ServerUnreachable { address: reported }) => assert_eq!(reported, address),
        other => panic!("expected ServerUnreachable, got {other:?}"),
    }
    assert!(!client.is_connected());
}
