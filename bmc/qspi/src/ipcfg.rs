// Licensed under the Apache-2.0 license

//! Per-unit IP configuration.
//!
//! The setting is a kernel `ip=` value such as `dhcp` or
//! `client::gateway:netmask::iface`, stored NUL-terminated in
//! `/boot/<machine>-per.bin` (or the per-unit partition on legacy layouts).

use crate::error::{QspiError, QspiResult};
use crate::image_file_name;
use flash_layout::PartitionId;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const DEFAULT_PER: &[u8] = b"dhcp\0";

pub fn per_file(boot_dir: &Path, machine: &str) -> PathBuf {
    boot_dir.join(image_file_name(machine, PartitionId::PerUnit))
}

/// Reads the persisted setting without its NUL terminator. `None` when the
/// file does not exist.
pub fn read_ip_config(boot_dir: &Path, machine: &str) -> QspiResult<Option<String>> {
    let path = per_file(boot_dir, machine);
    match std::fs::read(&path) {
        Ok(per) => {
            let end = per.iter().position(|&b| b == 0).unwrap_or(per.len());
            Ok(Some(String::from_utf8_lossy(&per[..end]).into_owned()))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(QspiError::file(path, e)),
    }
}

pub fn write_ip_config(boot_dir: &Path, machine: &str, ip: &str) -> QspiResult<()> {
    if ip.contains('\0') {
        return Err(QspiError::EnvFormat(ip.into()));
    }
    let path = per_file(boot_dir, machine);
    let mut per = ip.as_bytes().to_vec();
    per.push(0);
    std::fs::write(&path, per).map_err(|e| QspiError::file(path, e))
}

/// Builds the network start script for an `ip=` setting.
pub fn ip_command(per: &str) -> String {
    let fields: Vec<&str> = per.split(':').collect();
    let mut script = String::new();

    let client = fields[0];
    if client == "dhcp" {
        script.push_str("daemons start dhcpcd\n");
    } else {
        let prefix = fields
            .get(3)
            .and_then(|mask| mask.parse::<Ipv4Addr>().ok())
            .and_then(prefix_len);
        let address = match prefix {
            Some(len) => format!("{client}/{len}"),
            None => client.to_string(),
        };
        script.push_str("ip link eth0 change up\n");
        script.push_str(&format!("ip address add {address} dev eth0\n"));
    }
    if let Some(gateway) = fields.get(2) {
        script.push_str(&format!("ip route add 0.0.0.0/0 via {gateway}\n"));
    }
    script
}

/// Prefix length of a contiguous netmask.
fn prefix_len(mask: Ipv4Addr) -> Option<u32> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    (bits.checked_shl(ones).unwrap_or(0) == 0).then_some(ones)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_command_static() {
        assert_eq!(
            ip_command("172.17.3.52::172.17.2.1:255.255.254.0::eth0"),
            "ip link eth0 change up\n\
             ip address add 172.17.3.52/23 dev eth0\n\
             ip route add 0.0.0.0/0 via 172.17.2.1\n"
        );
    }

    #[test]
    fn test_ip_command_dhcp() {
        assert_eq!(ip_command("dhcp"), "daemons start dhcpcd\n");
    }

    #[test]
    fn test_ip_command_bad_netmask() {
        assert_eq!(
            ip_command("10.0.0.2::10.0.0.1:255.0.255.0"),
            "ip link eth0 change up\n\
             ip address add 10.0.0.2 dev eth0\n\
             ip route add 0.0.0.0/0 via 10.0.0.1\n"
        );
    }

    #[test]
    fn test_prefix_len() {
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 255, 255)), Some(32));
        assert_eq!(prefix_len(Ipv4Addr::new(0, 0, 0, 0)), Some(0));
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 255, 0)), Some(24));
        assert_eq!(prefix_len(Ipv4Addr::new(255, 0, 255, 0)), None);
    }

    #[test]
    fn test_ip_config_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_ip_config(dir.path(), "m").unwrap(), None);
        write_ip_config(dir.path(), "m", "10.0.0.2::10.0.0.1:255.255.255.0::eth0:on").unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("m-per.bin")).unwrap(),
            b"10.0.0.2::10.0.0.1:255.255.255.0::eth0:on\0"
        );
        assert_eq!(
            read_ip_config(dir.path(), "m").unwrap().as_deref(),
            Some("10.0.0.2::10.0.0.1:255.255.255.0::eth0:on")
        );
    }
}
