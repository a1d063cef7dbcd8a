//! Device nodes seeded into the jail's private /dev.
//!
//! The jail gets a tmpfs over /dev rather than a bind of the host's, so
//! only these nodes exist inside. Majors and minors follow the kernel's
//! fixed character device assignments (Documentation/admin-guide/devices).

/// One character device node.
#[derive(Debug, Clone, Copy)]
pub struct DeviceNode {
    pub name: &'static str,
    /// Permission bits, octal.
    pub mode: u32,
    pub major: u32,
    pub minor: u32,
}

/// The fixed set a minimal chroot needs for package tooling to function.
pub const DEVICE_NODES: &[DeviceNode] = &[
    DeviceNode { name: "null", mode: 0o666, major: 1, minor: 3 },
    DeviceNode { name: "zero", mode: 0o666, major: 1, minor: 5 },
    DeviceNode { name: "full", mode: 0o666, major: 1, minor: 7 },
    DeviceNode { name: "random", mode: 0o666, major: 1, minor: 8 },
    DeviceNode { name: "urandom", mode: 0o666, major: 1, minor: 9 },
    DeviceNode { name: "tty", mode: 0o666, major: 5, minor: 0 },
    // Writable by root only; everything else is world accessible.
    DeviceNode { name: "console", mode: 0o600, major: 5, minor: 1 },
    DeviceNode { name: "ptmx", mode: 0o666, major: 5, minor: 2 },
];
