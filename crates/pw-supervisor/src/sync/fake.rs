//! Scripted collaborators for pipeline and orchestrator tests

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use pw_core::{AddressResolver, InterfaceError, PwError, RemoteError};
use pw_protocol::{ProtocolError, Torrent};

use super::client::ClientRpc;
use super::forward::PortForwarder;

/// Take one pending failure, if any
fn take_failure(pending: &AtomicU32) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub(crate) struct FakeResolver {
    interface: String,
    address: Mutex<String>,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FakeResolver {
    pub fn new(interface: &str, address: &str) -> Self {
        Self {
            interface: interface.to_string(),
            address: Mutex::new(address.to_string()),
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_address(&self, address: &str) {
        *self.address.lock().unwrap() = address.to_string();
    }
}

impl AddressResolver for FakeResolver {
    fn interface_addresses(&self, interface: &str) -> Result<Vec<String>, InterfaceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if interface != self.interface || take_failure(&self.failures) {
            return Err(InterfaceError::NotFound(interface.to_string()));
        }
        Ok(vec![self.address.lock().unwrap().clone()])
    }
}

pub(crate) struct FakeForwarder {
    port: AtomicU32,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FakeForwarder {
    pub fn new(port: u16) -> Self {
        Self {
            port: AtomicU32::new(port as u32),
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port as u32, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortForwarder for FakeForwarder {
    async fn request_port(&self, _local_address: IpAddr) -> Result<u16, PwError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            return Err(ProtocolError::Rejected("port forwarding unavailable".to_string()).into());
        }
        Ok(self.port.load(Ordering::SeqCst) as u16)
    }
}

#[derive(Default)]
pub(crate) struct FakeClient {
    ports: Mutex<Vec<u16>>,
    set_port_calls: AtomicU32,
    fail_set_port: AtomicBool,
    port_closed: AtomicBool,
    fail_list: AtomicBool,
    removal_failures: AtomicU32,
    torrents: Mutex<Vec<Torrent>>,
    removed: Mutex<Vec<i64>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports successfully set over RPC
    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }

    pub fn set_port_calls(&self) -> u32 {
        self.set_port_calls.load(Ordering::SeqCst)
    }

    pub fn fail_set_port(&self, fail: bool) {
        self.fail_set_port.store(fail, Ordering::SeqCst);
    }

    pub fn close_port(&self, closed: bool) {
        self.port_closed.store(closed, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removals(&self, n: u32) {
        self.removal_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_torrents(&self, torrents: Vec<Torrent>) {
        *self.torrents.lock().unwrap() = torrents;
    }

    pub fn removed(&self) -> Vec<i64> {
        self.removed.lock().unwrap().clone()
    }
}

fn unreachable_client() -> PwError {
    RemoteError::Status {
        status: 502,
        url: "http://127.0.0.1:9091/transmission/rpc".to_string(),
    }
    .into()
}

#[async_trait]
impl ClientRpc for FakeClient {
    async fn set_peer_port(&self, port: u16) -> Result<(), PwError> {
        self.set_port_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_set_port.load(Ordering::SeqCst) {
            return Err(unreachable_client());
        }
        self.ports.lock().unwrap().push(port);
        Ok(())
    }

    async fn test_port(&self) -> Result<bool, PwError> {
        Ok(!self.port_closed.load(Ordering::SeqCst))
    }

    async fn list_torrents(&self) -> Result<Vec<Torrent>, PwError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(unreachable_client());
        }
        Ok(self.torrents.lock().unwrap().clone())
    }

    async fn remove_torrents(&self, ids: &[i64], _delete_local_data: bool) -> Result<(), PwError> {
        if take_failure(&self.removal_failures) {
            return Err(unreachable_client());
        }
        self.removed.lock().unwrap().extend_from_slice(ids);
        self.torrents
            .lock()
            .unwrap()
            .retain(|t| !ids.contains(&t.id));
        Ok(())
    }
}
