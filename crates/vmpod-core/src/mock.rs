//! In-memory VM backend and remote client used by the unit tests.

use crate::client::{ExecResult, RemoteClient, RemoteConnector};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use vmpod_vm::{ProvisionSpec, VmBackend, VmError, VmHandle, VmState};

static NEXT_HOST: AtomicU32 = AtomicU32::new(2);

/// Shared knobs and counters for one fake VM.
#[derive(Default)]
struct VmFlags {
    running: AtomicBool,
    state_error: AtomicBool,
    stop_error: AtomicBool,
    destroy_error: AtomicBool,
    stopped: AtomicUsize,
    destroyed: AtomicUsize,
    destroy_gate: Mutex<Option<Arc<Gate>>>,
}

/// Lets a test hold `destroy` open until it says go.
#[derive(Default)]
pub(crate) struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub(crate) async fn entered(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Clone)]
pub(crate) struct VmControl(Arc<VmFlags>);

impl VmControl {
    pub(crate) fn set_running(&self, running: bool) {
        self.0.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn set_state_error(&self, fail: bool) {
        self.0.state_error.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_stop_error(&self, fail: bool) {
        self.0.stop_error.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_destroy_error(&self, fail: bool) {
        self.0.destroy_error.store(fail, Ordering::SeqCst);
    }

    /// Block the next `destroy` until the returned gate is released.
    pub(crate) fn gate_destroy(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.0.destroy_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub(crate) fn stopped(&self) -> usize {
        self.0.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.0.destroyed.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeVm {
    name: String,
    ips: Vec<IpAddr>,
    flags: Arc<VmFlags>,
}

impl FakeVm {
    pub(crate) fn new(name: &str) -> Self {
        let host = NEXT_HOST.fetch_add(1, Ordering::SeqCst);
        let ip = Ipv4Addr::from(u32::from(Ipv4Addr::new(172, 16, 0, 0)) + host);
        let flags = Arc::new(VmFlags::default());
        flags.running.store(true, Ordering::SeqCst);
        Self {
            name: name.to_string(),
            ips: vec![IpAddr::V4(ip)],
            flags,
        }
    }

    pub(crate) fn ip(&self) -> IpAddr {
        self.ips[0]
    }

    pub(crate) fn control(&self) -> VmControl {
        VmControl(self.flags.clone())
    }
}

#[async_trait]
impl VmHandle for FakeVm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ips(&self) -> vmpod_vm::Result<Vec<IpAddr>> {
        Ok(self.ips.clone())
    }

    async fn state(&self) -> vmpod_vm::Result<VmState> {
        if self.flags.state_error.load(Ordering::SeqCst) {
            return Err(VmError::Timeout(std::time::Duration::from_secs(5)));
        }
        if self.flags.running.load(Ordering::SeqCst) {
            Ok(VmState::Running)
        } else {
            Ok(VmState::Stopped)
        }
    }

    async fn stop(&self) -> vmpod_vm::Result<()> {
        if self.flags.stop_error.load(Ordering::SeqCst) {
            return Err(VmError::Stop("guest refused to shut down".into()));
        }
        self.flags.running.store(false, Ordering::SeqCst);
        self.flags.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(self: Box<Self>) -> vmpod_vm::Result<()> {
        let gate = self.flags.destroy_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.flags.destroy_error.load(Ordering::SeqCst) {
            return Err(VmError::Destroy("firecracker still running".into()));
        }
        self.flags.running.store(false, Ordering::SeqCst);
        self.flags.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Backend handing out [`FakeVm`]s named after the requested name.
#[derive(Default)]
pub(crate) struct FakeBackend {
    vms: Mutex<HashMap<String, VmControl>>,
    fail_provision: AtomicBool,
    no_ips: AtomicBool,
    provision_delay: Mutex<Option<std::time::Duration>>,
}

impl FakeBackend {
    pub(crate) fn set_fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    /// Provisioned VMs come up without any address.
    pub(crate) fn set_no_ips(&self, none: bool) {
        self.no_ips.store(none, Ordering::SeqCst);
    }

    pub(crate) fn set_provision_delay(&self, delay: std::time::Duration) {
        *self.provision_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn control(&self, name: &str) -> VmControl {
        self.vms.lock().unwrap()[name].clone()
    }

    pub(crate) fn provisioned(&self) -> usize {
        self.vms.lock().unwrap().len()
    }

    /// Total successful destroys across every VM.
    pub(crate) fn destroyed(&self) -> usize {
        self.vms.lock().unwrap().values().map(VmControl::destroyed).sum()
    }
}

#[async_trait]
impl VmBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn provision(&self, spec: ProvisionSpec) -> vmpod_vm::Result<Box<dyn VmHandle>> {
        let delay = *self.provision_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(VmError::Create("image clone failed".into()));
        }
        let mut vm = FakeVm::new(&spec.name);
        if self.no_ips.load(Ordering::SeqCst) {
            vm.ips.clear();
        }
        self.vms.lock().unwrap().insert(spec.name, vm.control());
        Ok(Box::new(vm))
    }
}

#[derive(Default)]
pub(crate) struct FakeClient {
    closed: AtomicUsize,
    execs: AtomicUsize,
}

impl FakeClient {
    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteClient for FakeClient {
    async fn ping(&self) -> Result<()> {
        if self.closed() > 0 {
            return Err(CoreError::Connection("client closed".into()));
        }
        Ok(())
    }

    async fn exec(&self, cmd: &str) -> Result<ExecResult> {
        self.ping().await?;
        self.execs.fetch_add(1, Ordering::SeqCst);
        Ok(ExecResult {
            exit_code: 0,
            stdout: format!("{cmd}\n"),
            stderr: String::new(),
        })
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector that records every client it hands out.
#[derive(Default)]
pub(crate) struct FakeConnector {
    clients: Mutex<HashMap<IpAddr, Arc<FakeClient>>>,
    fail: AtomicBool,
    hang: AtomicBool,
}

impl FakeConnector {
    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Never answer, so the caller's connect timeout fires.
    pub(crate) fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn client(&self, ip: IpAddr) -> Arc<FakeClient> {
        self.clients.lock().unwrap()[&ip].clone()
    }

    pub(crate) fn closed(&self) -> usize {
        self.clients.lock().unwrap().values().map(|c| c.closed()).sum()
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(&self, ip: IpAddr) -> Result<Arc<dyn RemoteClient>> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Connection("connection refused".into()));
        }
        let client = Arc::new(FakeClient::default());
        self.clients.lock().unwrap().insert(ip, client.clone());
        Ok(client)
    }
}
