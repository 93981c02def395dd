//! QEMU command-line construction.

use super::QemuSettings;

/// Ports allocated for one boot attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BootPorts {
    /// Local port of the QMP control socket.
    pub monitor: u16,
    /// Local port forwarded to the guest's SSH daemon.
    pub ssh: u16,
}

/// Builds the QEMU argument list for slot `index`.
///
/// The result depends only on its inputs, so two boots with the same
/// settings and ports produce identical command lines.
#[must_use]
pub fn build_qemu_args(settings: &QemuSettings, index: usize, ports: BootPorts) -> Vec<String> {
    vec![
        String::from("-m"),
        settings.mem.to_string(),
        String::from("-smp"),
        settings.cpu.to_string(),
        String::from("-chardev"),
        format!(
            "socket,id=SOCKSYZ,server=on,wait=off,host=localhost,port={}",
            ports.monitor
        ),
        String::from("-mon"),
        String::from("chardev=SOCKSYZ,mode=control"),
        String::from("-display"),
        String::from("none"),
        String::from("-serial"),
        String::from("stdio"),
        String::from("-no-reboot"),
        String::from("-name"),
        format!("VM-{index}"),
        String::from("-device"),
        String::from("virtio-rng-pci"),
        String::from("-enable-kvm"),
        String::from("-cpu"),
        String::from("host,migratable=off"),
        String::from("-device"),
        String::from("e1000,netdev=net0"),
        String::from("-netdev"),
        format!("user,id=net0,restrict=on,hostfwd=tcp:127.0.0.1:{}-:22", ports.ssh),
        String::from("-drive"),
        format!("file={},format=raw", settings.image),
        String::from("-snapshot"),
        String::from("-kernel"),
        settings.kernel.to_string(),
        String::from("-append"),
        settings.kernel_cmdline.clone(),
    ]
}
