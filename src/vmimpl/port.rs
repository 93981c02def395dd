//! Local TCP port allocation.

use std::net::{Ipv4Addr, TcpListener};

use super::VmError;

/// Returns a loopback TCP port that was free at the time of the call.
///
/// The port is released before returning, so another process may grab it
/// first; callers retry provisioning when QEMU reports the address as taken.
///
/// # Errors
///
/// Returns [`VmError::Io`] when no port can be bound.
pub fn unused_tcp_port() -> Result<u16, VmError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|err| VmError::io("binding a free local port", &err))?;
    let addr = listener
        .local_addr()
        .map_err(|err| VmError::io("reading bound local port", &err))?;
    Ok(addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_non_zero_and_bindable() {
        let port = unused_tcp_port().expect("port");

        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).expect("port should be free again");
    }
}
