//! Run configuration: how to open the port and what the run should do,
//! as opposed to what to write (that's a list of [`crate::flasher::Segment`]s
//! supplied separately).

/// Settings for a single flashing run, constructed directly by a library
/// caller or parsed from CLI flags by the binary.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: String,
    /// Baud rate to use while talking to the ROM, before any stub is loaded.
    pub rom_baud: u32,
    /// Baud rate to request once the stub is active; 0 keeps `rom_baud`.
    pub stub_baud: u32,
    /// Issue `BOOT_FW` once every segment has been written.
    pub reboot: bool,
    /// Restrict a bundle write to entries whose filename starts with `user`.
    pub firmware_only: bool,
}

impl Config {
    pub fn new(port: impl Into<String>) -> Self {
        Config {
            port: port.into(),
            rom_baud: crate::flasher::ROM_BAUD_DEFAULT,
            stub_baud: 921_600,
            reboot: true,
            firmware_only: false,
        }
    }
}
