//! One diagnostic session: the shared command channel plus every
//! component built on it.

use crate::channel::h4::CommandResponse;
use crate::channel::{CaptureKind, ChannelConfig, CommandChannel, Transport};
use crate::connection::ConnectionRegistry;
use crate::device::{self, DeviceInfo};
use crate::error::Result;
use crate::firmware::FirmwareMap;
use crate::hook::{Assembler, HookInstaller};
use crate::lmp::LmpSender;
use crate::memory::{ImageTemplate, MemoryEngine};
use crate::monitor::{MonitorRegistry, ViewerLauncher};
use crate::patchram::PatchTable;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Session {
    monitors: MonitorRegistry,
    memory: MemoryEngine,
    channel: Arc<CommandChannel>,
}

impl Session {
    /// Validate `map` and bring up the command channel over `transport`.
    pub fn connect(
        transport: Box<dyn Transport>,
        config: ChannelConfig,
        map: FirmwareMap,
        launcher: Arc<dyn ViewerLauncher>,
    ) -> Result<Self> {
        map.validate()?;
        let channel = CommandChannel::connect(transport, config)?;
        info!("Session opened for {}", map.name);
        Ok(Self::new(Arc::new(channel), Arc::new(map), launcher))
    }

    /// `map` must already be validated.
    pub(crate) fn new(
        channel: Arc<CommandChannel>,
        map: Arc<FirmwareMap>,
        launcher: Arc<dyn ViewerLauncher>,
    ) -> Self {
        Session {
            monitors: MonitorRegistry::new(Arc::clone(&channel), launcher),
            memory: MemoryEngine::new(Arc::clone(&channel), map),
            channel,
        }
    }

    pub fn with_template(mut self, template: ImageTemplate) -> Self {
        self.memory = self.memory.with_template(template);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.monitors = self.monitors.with_poll_interval(poll_interval);
        self
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn map(&self) -> &FirmwareMap {
        self.memory.map()
    }

    pub fn memory(&self) -> &MemoryEngine {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryEngine {
        &mut self.memory
    }

    pub fn patches(&self) -> PatchTable<'_> {
        PatchTable::new(&self.memory)
    }

    pub fn connections(&self) -> ConnectionRegistry<'_> {
        ConnectionRegistry::new(&self.memory)
    }

    pub fn hooks<'a, A: Assembler + ?Sized>(&'a self, assembler: &'a A) -> HookInstaller<'a, A> {
        HookInstaller::new(&self.memory, assembler)
    }

    pub fn lmp<'a, A: Assembler + ?Sized>(&'a self, assembler: &'a A) -> LmpSender<'a, A> {
        LmpSender::new(&self.memory, assembler)
    }

    pub fn device_info(&self) -> Result<DeviceInfo> {
        DeviceInfo::read(&self.memory)
    }

    pub fn monitors(&self) -> &MonitorRegistry {
        &self.monitors
    }

    /// Start a monitor. LMP frames need our own address, so it is read
    /// from the controller first.
    pub fn start_monitor(&self, kind: CaptureKind) -> Result<()> {
        if kind == CaptureKind::Lmp {
            let local = device::read_address(&self.memory)?;
            self.monitors.set_local_address(local);
        }
        self.monitors.start(kind)
    }

    /// Raw HCI command, status not interpreted.
    pub fn send_hci_command(&self, opcode: u16, params: &[u8]) -> Result<CommandResponse> {
        self.channel.send(opcode, params)
    }

    /// Kill both monitors and close the channel.
    pub fn close(&self) {
        self.monitors.kill(CaptureKind::Hci);
        self.monitors.kill(CaptureKind::Lmp);
        self.channel.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{MockController, OP_READ_RAM};
    use crate::error::Error;
    use crate::firmware::Section;
    use crate::memory::tests::scenario_map;
    use crate::monitor::ViewerProcess;
    use crate::patchram::PatchTarget;
    use std::io;

    struct NoViewer;

    impl ViewerLauncher for NoViewer {
        fn launch(&self, _kind: CaptureKind) -> io::Result<Box<dyn ViewerProcess>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no viewer installed"))
        }
    }

    fn open(mock: &MockController, map: FirmwareMap) -> Result<Session> {
        Session::connect(
            Box::new(mock.clone()),
            ChannelConfig::default(),
            map,
            Arc::new(NoViewer),
        )
    }

    #[test]
    fn test_scenario() {
        let mock = MockController::new();
        mock.load(0x95000, &[0x5a; 8]);
        let session = open(&mock, scenario_map()).unwrap();

        session.memory().write_mem(0x95000, &[0; 8], None).unwrap();
        assert_eq!(session.memory().read_mem(0x95000, 8, None).unwrap(), vec![0; 8]);

        let branch = [0x00, 0xf0, 0x5e, 0xfa];
        let slot = session.patches().install(0x2fed8, &branch, None).unwrap();
        let state = session.patches().state().unwrap();
        assert!(state[slot].active);
        assert_eq!(state[slot].address, 0x2fed8);
        assert_eq!(state[slot].value, branch);

        session.patches().remove(PatchTarget::Address(0x2fed8)).unwrap();
        assert!(!session.patches().state().unwrap()[slot].active);
    }

    #[test]
    fn test_invalid_map_rejected_before_connecting() {
        let mock = MockController::new();
        let mut map = scenario_map();
        map.sections.push(Section::ram(0x8f000, 0x91000));

        assert!(matches!(open(&mock, map), Err(Error::InvalidFirmwareMap(_))));
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_zero_chunk_size_rejected_before_connecting() {
        let mock = MockController::new();
        let map = FirmwareMap {
            read_chunk_size: 0,
            ..scenario_map()
        };

        assert!(matches!(open(&mock, map), Err(Error::InvalidFirmwareMap(_))));
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_lmp_monitor_reads_local_address_first() {
        let mock = MockController::new();
        let session = open(&mock, FirmwareMap::bcm4339()).unwrap();

        let err = session.start_monitor(CaptureKind::Lmp).unwrap_err();
        assert!(matches!(err, Error::Viewer(_)));
        assert_eq!(mock.command_count(OP_READ_RAM), 1);
        assert!(!session.monitors().status(CaptureKind::Lmp));
    }

    #[test]
    fn test_close_disconnects() {
        let mock = MockController::new();
        let session = open(&mock, scenario_map()).unwrap();
        session.close();

        assert!(!session.channel().is_connected());
        assert!(matches!(
            session.memory().read_mem(0x0, 4, None),
            Err(Error::PartialIo { bytes_done: 0, .. })
        ));
    }
}
