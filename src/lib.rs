//! Library crate for nmap-session-rs: run nmap scans in the background and poll for results.
pub mod error;
pub mod logging;
pub mod nmap_xml;
pub mod scanner;
pub mod session;
pub mod types;
