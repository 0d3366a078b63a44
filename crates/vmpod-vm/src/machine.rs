//! VirtualMachine type - main interface for managing MicroVMs.

use crate::api::ApiSocket;
use crate::config::MachineConfig;
use crate::error::{Result, VmError};
use firepilot::builder::drive::DriveBuilder;
use firepilot::builder::executor::FirecrackerExecutorBuilder;
use firepilot::builder::kernel::KernelBuilder;
use firepilot::builder::network_interface::NetworkInterfaceBuilder;
use firepilot::builder::{Builder, Configuration};
use firepilot::machine::Machine;
use std::path::PathBuf;
use uuid::Uuid;

/// A running or stopped MicroVM instance.
pub struct VirtualMachine {
    id: Uuid,
    config: MachineConfig,
    /// Last state this process drove the VM into.
    state: VmState,
    machine: Machine,
    /// Path to the Firecracker API socket
    socket_path: PathBuf,
}

/// Current state of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// VM is being created
    Creating,
    /// VM is running
    Running,
    /// VM is paused
    Paused,
    /// VM is stopped
    Stopped,
}

impl VmState {
    /// Whether the guest is up.
    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Creating => write!(f, "creating"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Stopped => write!(f, "stopped"),
        }
    }
}

impl VirtualMachine {
    /// Create and boot a new MicroVM with a random ID.
    pub async fn create(config: MachineConfig) -> Result<Self> {
        Self::create_with_id(Uuid::new_v4(), config).await
    }

    /// Create and boot a new MicroVM under the given ID.
    ///
    /// This will:
    /// 1. Build the firepilot configuration
    /// 2. Create the Machine instance (spawns Firecracker)
    /// 3. Size vCPUs and memory over the API socket
    /// 4. Start the VM
    ///
    /// # Errors
    /// Returns an error if the VM creation or startup fails.
    pub async fn create_with_id(id: Uuid, config: MachineConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(%id, vcpus = config.vcpu_count, memory_mib = config.memory_mib, "Creating MicroVM");

        let kernel = KernelBuilder::new()
            .with_kernel_image_path(config.kernel_path.to_string_lossy().to_string())
            .with_boot_args(config.kernel_cmdline())
            .try_build()
            .map_err(|e| VmError::Config(format!("kernel config: {:?}", e)))?;

        let mut drive_builder = DriveBuilder::new()
            .with_drive_id(config.root_drive.drive_id.clone())
            .with_path_on_host(config.root_drive.path_on_host.clone())
            .as_root_device();
        if config.root_drive.is_read_only {
            drive_builder = drive_builder.as_read_only();
        }
        let drive = drive_builder
            .try_build()
            .map_err(|e| VmError::Config(format!("drive config: {:?}", e)))?;

        let executor = FirecrackerExecutorBuilder::new()
            .with_chroot(config.chroot_path.to_string_lossy().to_string())
            .with_exec_binary(config.firecracker_path.clone())
            .try_build()
            .map_err(|e| VmError::Config(format!("executor config: {:?}", e)))?;

        let mut fp_config = Configuration::new(id.to_string())
            .with_kernel(kernel)
            .with_executor(executor)
            .with_drive(drive);

        if let Some(net) = &config.network {
            let mut net_builder = NetworkInterfaceBuilder::new()
                .with_iface_id(net.iface_id.clone())
                .with_host_dev_name(net.host_dev_name.clone());
            if let Some(mac) = &net.guest_mac {
                net_builder = net_builder.with_guest_mac(mac.clone());
            }
            let iface = net_builder
                .try_build()
                .map_err(|e| VmError::Config(format!("network config: {:?}", e)))?;
            fp_config = fp_config.with_interface(iface);
        }

        let mut machine = Machine::new();
        machine
            .create(fp_config)
            .await
            .map_err(|e| VmError::Create(format!("{:?}", e)))?;

        // chroot_path / vm_id / firecracker.socket
        let socket_path = config
            .chroot_path
            .join(id.to_string())
            .join("firecracker.socket");

        // Firecracker rejects machine-config once the instance is started
        if let Err(e) = ApiSocket::new(&socket_path)
            .configure_machine(config.vcpu_count, config.memory_mib)
            .await
        {
            let _ = machine.kill().await;
            return Err(e);
        }

        if let Err(e) = machine.start().await {
            let _ = machine.kill().await;
            return Err(VmError::Start(format!("{:?}", e)));
        }

        tracing::info!(%id, "MicroVM started");

        Ok(Self {
            id,
            config,
            state: VmState::Running,
            machine,
            socket_path,
        })
    }

    /// Get the unique ID of this VM.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Last known state, without asking Firecracker.
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Get the configuration used to create this VM.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Get the path to the Firecracker API socket.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Ask Firecracker for the live instance state.
    ///
    /// A VM this process stopped, or whose API socket has vanished, is
    /// reported as [`VmState::Stopped`] without a round trip.
    pub async fn probe_state(&mut self) -> Result<VmState> {
        if self.state == VmState::Stopped {
            return Ok(VmState::Stopped);
        }
        if !tokio::fs::try_exists(&self.socket_path).await? {
            tracing::debug!(id = %self.id, "API socket gone, VM considered stopped");
            self.state = VmState::Stopped;
            return Ok(VmState::Stopped);
        }

        let info = ApiSocket::new(&self.socket_path).instance_info().await?;
        let state = info.vm_state();
        tracing::trace!(id = %self.id, reported = %info.state, %state, "Probed VM state");
        self.state = state;
        Ok(state)
    }

    /// Stop the VM gracefully.
    ///
    /// # Errors
    /// Returns an error if the VM is not running.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != VmState::Running {
            return Err(VmError::InvalidState {
                expected: "running".into(),
                actual: self.state.to_string(),
            });
        }

        tracing::info!(id = %self.id, "Stopping VM");
        self.machine
            .stop()
            .await
            .map_err(|e| VmError::Stop(format!("{:?}", e)))?;

        self.state = VmState::Stopped;
        Ok(())
    }

    /// Force kill the VM.
    pub async fn kill(&mut self) -> Result<()> {
        tracing::warn!(id = %self.id, "Force killing VM");
        self.machine
            .kill()
            .await
            .map_err(|e| VmError::Stop(format!("kill failed: {:?}", e)))?;

        self.state = VmState::Stopped;
        Ok(())
    }

    /// Destroy the VM, killing the Firecracker process if it is still up.
    pub async fn destroy(mut self) -> Result<()> {
        tracing::info!(id = %self.id, state = %self.state, "Destroying VM");

        if self.state != VmState::Stopped {
            if let Err(e) = self.kill().await {
                // A process that already exited has no socket left to kill
                if tokio::fs::try_exists(&self.socket_path).await.unwrap_or(true) {
                    return Err(VmError::Destroy(e.to_string()));
                }
                tracing::debug!(id = %self.id, error = %e, "Firecracker already gone");
            }
        }

        drop(self.machine);
        Ok(())
    }
}
