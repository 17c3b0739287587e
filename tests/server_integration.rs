//! Integration tests for the broker over a real Unix socket.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use usb_broker::filter::{ClassTriplet, FilterPolicy};
use usb_broker::gateway::{
    DeviceEnumerator, DeviceNode, DeviceOpError, DriverInstaller, DriverOpsGateway, InstallError,
    RetryPolicy,
};
use usb_broker::protocol::{BrokerClient, Message};
use usb_broker::server::{PipeServer, ServerHandle};

const MANAGED: &str = "usb_generic";

/// One fake USB device behind both collaborator seams. Installs flip the
/// bound driver to the managed kind; uninstalls clear it.
#[derive(Default)]
struct TestBus {
    device: Mutex<Option<DeviceNode>>,
    install_calls: AtomicU32,
    uninstall_calls: AtomicU32,
    detach_calls: AtomicU32,
    pending_before_success: AtomicU32,
}

impl TestBus {
    fn with_device(vid: u16, pid: u16, class: u8) -> Self {
        let bus = Self::default();
        *bus.device.lock().unwrap() = Some(DeviceNode {
            node_id: format!("{vid:04x}:{pid:04x}"),
            driver: None,
            device_triplet: ClassTriplet {
                class,
                subclass: 0,
                protocol: 0,
            },
            interface_triplets: Vec::new(),
        });
        bus
    }
}

#[async_trait]
impl DeviceEnumerator for TestBus {
    async fn find_device(&self, _vid: u16, _pid: u16) -> Result<Option<DeviceNode>, DeviceOpError> {
        Ok(self.device.lock().unwrap().clone())
    }

    async fn uninstall_package(
        &self,
        _node: &DeviceNode,
        _package: &str,
    ) -> Result<(), DeviceOpError> {
        self.uninstall_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(device) = self.device.lock().unwrap().as_mut() {
            device.driver = None;
        }
        Ok(())
    }

    async fn detach_node(&self, _node: &DeviceNode) -> Result<(), DeviceOpError> {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rescan(&self) -> Result<(), DeviceOpError> {
        Ok(())
    }
}

#[async_trait]
impl DriverInstaller for TestBus {
    async fn install_driver(&self, _node: &DeviceNode, _package: &str) -> Result<(), InstallError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .pending_before_success
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(InstallError::Pending);
        }
        if let Some(device) = self.device.lock().unwrap().as_mut() {
            device.driver = Some(MANAGED.to_string());
        }
        Ok(())
    }
}

struct TestBroker {
    bus: Arc<TestBus>,
    handle: ServerHandle,
    socket_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn start_broker_with(
    bus: TestBus,
    rules: Option<&str>,
    max_connections: usize,
) -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("usb-broker.sock");
    let bus = Arc::new(bus);
    let gateway = Arc::new(DriverOpsGateway::new(
        Arc::clone(&bus) as Arc<dyn DeviceEnumerator>,
        Arc::clone(&bus) as Arc<dyn DriverInstaller>,
        FilterPolicy::from_config(rules),
        MANAGED,
        RetryPolicy {
            attempts: 3,
            interval: Duration::from_millis(1),
        },
    ));
    let handle = PipeServer::new(&socket_path, gateway)
        .with_max_connections(max_connections)
        .start()
        .unwrap();
    TestBroker {
        bus,
        handle,
        socket_path,
        _dir: dir,
    }
}

fn start_broker(bus: TestBus, rules: Option<&str>) -> TestBroker {
    start_broker_with(bus, rules, 8)
}

#[tokio::test]
async fn install_round_trip_with_pending_retry() {
    let bus = TestBus::with_device(0x04b4, 0x0888, 0x00);
    bus.pending_before_success.store(1, Ordering::SeqCst);
    let broker = start_broker(bus, None);

    let mut client = BrokerClient::connect(&broker.socket_path).await.unwrap();
    assert!(client.install(0x04b4, 0x0888).await.unwrap());
    // one pending outcome, one success
    assert_eq!(broker.bus.install_calls.load(Ordering::SeqCst), 2);

    // non-session grant: disconnect reverts nothing
    drop(client);
    broker.handle.shutdown().await;
    assert_eq!(broker.bus.uninstall_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn install_is_idempotent_for_already_bound_device() {
    let bus = TestBus::with_device(0x04b4, 0x0888, 0x00);
    if let Some(device) = bus.device.lock().unwrap().as_mut() {
        device.driver = Some(MANAGED.to_string());
    }
    let broker = start_broker(bus, None);

    let mut client = BrokerClient::connect(&broker.socket_path).await.unwrap();
    assert!(client.install(0x04b4, 0x0888).await.unwrap());
    assert_eq!(broker.bus.install_calls.load(Ordering::SeqCst), 0);

    drop(client);
    broker.handle.shutdown().await;
}

#[tokio::test]
async fn session_install_reverted_once_on_disconnect() {
    let bus = TestBus::with_device(0x1234, 0x5678, 0x00);
    let broker = start_broker(bus, None);

    let mut client = BrokerClient::connect(&broker.socket_path).await.unwrap();
    assert!(client.session_install(0x1234, 0x5678).await.unwrap());
    drop(client);

    broker.handle.shutdown().await;
    assert_eq!(broker.bus.uninstall_calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.bus.detach_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn policy_deny_replies_failure_and_keeps_connection_open() {
    let bus = TestBus::with_device(0x1234, 0x5678, 0x03);
    let broker = start_broker(bus, Some("0x03,-1,-1,-1,0"));

    let mut client = BrokerClient::connect(&broker.socket_path).await.unwrap();
    assert!(!client.install(0x1234, 0x5678).await.unwrap());
    assert_eq!(broker.bus.install_calls.load(Ordering::SeqCst), 0);

    // the connection survives a denial and takes further requests
    assert!(!client.install(0x1234, 0x5678).await.unwrap());

    drop(client);
    broker.handle.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_closes_connection_without_reply() {
    let bus = TestBus::with_device(1, 2, 0x00);
    let broker = start_broker(bus, None);

    let mut stream = UnixStream::connect(&broker.socket_path).await.unwrap();
    stream.write_all(&[0xFFu8; 12]).await.unwrap();

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
        .await
        .expect("server should close, not stall");
    assert_eq!(read.unwrap(), 0);

    broker.handle.shutdown().await;
}

#[tokio::test]
async fn concurrent_installs_for_same_device_both_complete() {
    let bus = TestBus::with_device(0x04b4, 0x0888, 0x00);
    let broker = start_broker(bus, None);

    let path_a = broker.socket_path.clone();
    let path_b = broker.socket_path.clone();
    let a = tokio::spawn(async move {
        let mut client = BrokerClient::connect(&path_a).await.unwrap();
        client.install(0x04b4, 0x0888).await.unwrap()
    });
    let b = tokio::spawn(async move {
        let mut client = BrokerClient::connect(&path_b).await.unwrap();
        client.install(0x04b4, 0x0888).await.unwrap()
    });

    let (a, b) = tokio::join!(a, b);
    // no deadlock, and the install/already-bound short-circuits make both
    // outcomes success
    assert!(a.unwrap());
    assert!(b.unwrap());

    broker.handle.shutdown().await;
}

#[tokio::test]
async fn requests_on_one_connection_are_processed_in_order() {
    let bus = TestBus::with_device(0x1111, 0x2222, 0x00);
    let broker = start_broker(bus, None);

    let mut client = BrokerClient::connect(&broker.socket_path).await.unwrap();
    assert!(client.install(0x1111, 0x2222).await.unwrap());
    assert!(client.remove(0x1111, 0x2222).await.unwrap());
    // remove cleared the binding, install binds again
    assert!(client.install(0x1111, 0x2222).await.unwrap());
    assert_eq!(broker.bus.install_calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.bus.uninstall_calls.load(Ordering::SeqCst), 1);

    drop(client);
    broker.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_removes_socket_and_refuses_new_clients() {
    let bus = TestBus::with_device(1, 2, 0x00);
    let broker = start_broker(bus, None);
    let socket_path = broker.socket_path.clone();

    assert!(socket_path.exists());
    broker.handle.shutdown().await;
    assert!(!socket_path.exists());

    let err = BrokerClient::connect(&socket_path).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn admission_gate_defers_clients_beyond_the_cap() {
    let bus = TestBus::with_device(0x1111, 0x2222, 0x00);
    let broker = start_broker_with(bus, None, 1);

    let mut first = BrokerClient::connect(&broker.socket_path).await.unwrap();
    assert!(first.install(0x1111, 0x2222).await.unwrap());

    // second client connects (backlog) but is not accepted while the
    // first holds the only slot
    let mut second = BrokerClient::connect(&broker.socket_path)
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(200));
    assert!(matches!(
        second.install(0x1111, 0x2222).await,
        Err(usb_broker::protocol::ClientError::Timeout(_))
    ));

    drop(first);
    let mut second = second.with_timeout(Duration::from_secs(5));
    assert!(second.install(0x1111, 0x2222).await.unwrap());

    broker.handle.shutdown().await;
}

#[tokio::test]
async fn raw_frame_reply_layout_matches_wire_contract() {
    let bus = TestBus::with_device(0x04b4, 0x0888, 0x00);
    let broker = start_broker(bus, None);

    let mut stream = UnixStream::connect(&broker.socket_path).await.unwrap();
    stream
        .write_all(&Message::Install { vid: 0x04b4, pid: 0x0888 }.encode())
        .await
        .unwrap();

    let mut reply = [0u8; 12];
    stream.read_exact(&mut reply).await.unwrap();
    // magic, version, type=Reply, size=12, status nonzero
    assert_eq!(&reply[0..2], &0xDADAu16.to_le_bytes());
    assert_eq!(&reply[2..4], &0x0001u16.to_le_bytes());
    assert_eq!(&reply[4..6], &4u16.to_le_bytes());
    assert_eq!(&reply[6..8], &12u16.to_le_bytes());
    assert_ne!(&reply[8..12], &[0u8; 4]);

    drop(stream);
    broker.handle.shutdown().await;
}
