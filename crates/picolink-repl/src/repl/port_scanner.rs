//! Serial port discovery.
//!
//! Lists the system's serial ports and picks out MicroPython boards by
//! USB VID/PID so a session can auto-connect without a port name.

use crate::repl::error::{ReplError, ReplResult};
use crate::repl::types::ReplConfig;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Known boards
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// USB identity of a board that exposes a MicroPython REPL.
#[derive(Debug, Clone)]
pub struct KnownBoard {
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
}

pub fn known_boards() -> Vec<KnownBoard> {
    vec![
        KnownBoard { vid: 0x2E8A, pid: 0x0005, manufacturer: "Raspberry Pi", product: "MicroPython (RP2040)" },
        KnownBoard { vid: 0x2E8A, pid: 0x000A, manufacturer: "Raspberry Pi", product: "Pico CDC" },
        KnownBoard { vid: 0xF055, pid: 0x9800, manufacturer: "MicroPython", product: "pyboard" },
        KnownBoard { vid: 0x303A, pid: 0x4001, manufacturer: "Espressif", product: "MicroPython (ESP32-S2)" },
    ]
}

pub fn lookup_board(vid: u16, pid: u16) -> Option<KnownBoard> {
    known_boards().into_iter().find(|b| b.vid == vid && b.pid == pid)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port info
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One discovered port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    pub fn display_name(&self) -> String {
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            if let Some(board) = lookup_board(vid, pid) {
                return format!("{} ({} {})", self.port_name, board.manufacturer, board.product);
            }
            return format!("{} (USB {:04X}:{:04X})", self.port_name, vid, pid);
        }
        self.port_name.clone()
    }
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => Self {
                port_name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => Self {
                port_name: info.port_name,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial_number: None,
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Scanning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every serial port the OS reports.
pub fn scan_ports() -> ReplResult<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    log::debug!("port scan found {} port(s)", ports.len());
    Ok(ports.into_iter().map(PortInfo::from).collect())
}

/// Ports whose USB identity matches `vid`/`pid`, in scan order.
pub fn match_ports(ports: Vec<PortInfo>, vid: u16, pid: u16) -> Vec<PortInfo> {
    ports
        .into_iter()
        .filter(|p| p.vid == Some(vid) && p.pid == Some(pid))
        .collect()
}

/// Port name to connect to: the configured one, or the first port that
/// matches the configured VID/PID.
pub fn resolve_port(config: &ReplConfig) -> ReplResult<String> {
    if let Some(name) = &config.port_name {
        return Ok(name.clone());
    }
    let found = match_ports(scan_ports()?, config.usb_vendor_id, config.usb_product_id);
    found.into_iter().next().map(|p| p.port_name).ok_or_else(|| {
        ReplError::transport(format!(
            "no board with USB id {:04X}:{:04X} found",
            config.usb_vendor_id, config.usb_product_id
        ))
    })
}
