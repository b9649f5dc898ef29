//! Parser for nmap's XML output (`-oX`).

use crate::error::ScanError;
use crate::types::{Hostname, HostResult, OsMatch, PortEntry, ScanResult, ServiceInfo};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

/// Parse a complete nmap XML document into a [`ScanResult`].
pub fn parse_nmap_xml(xml: &str) -> Result<ScanResult, ScanError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut result = ScanResult::default();
    let mut saw_root = false;

    let mut current_host: Option<HostResult> = None;
    let mut current_port: Option<PortEntry> = None;
    let mut current_service: Option<ServiceInfo> = None;
    let mut in_cpe = false;

    loop {
        let event = reader.read_event()?;
        // Self-closing elements never produce an End event.
        let (start, is_empty) = match &event {
            Event::Start(e) => (Some(e), false),
            Event::Empty(e) => (Some(e), true),
            _ => (None, false),
        };

        if let Some(e) = start {
            let attrs = attributes(e)?;
            match e.name().as_ref() {
                b"nmaprun" => {
                    saw_root = true;
                    result.command_line = attr(&attrs, "args");
                }
                b"host" => current_host = Some(HostResult::default()),
                b"status" => {
                    if let Some(host) = current_host.as_mut() {
                        host.state = attr(&attrs, "state");
                        host.reason = attr(&attrs, "reason");
                    }
                }
                b"address" => {
                    if let Some(host) = current_host.as_mut() {
                        host.addresses
                            .insert(attr(&attrs, "addrtype"), attr(&attrs, "addr"));
                    }
                }
                b"hostname" => {
                    if let Some(host) = current_host.as_mut() {
                        host.hostnames.push(Hostname {
                            name: attr(&attrs, "name"),
                            kind: attr(&attrs, "type"),
                        });
                    }
                }
                b"port" => {
                    let port = attr(&attrs, "portid")
                        .parse::<u16>()
                        .map_err(|e| ScanError::Parse(format!("invalid portid: {e}")))?;
                    current_port = Some(PortEntry {
                        protocol: attr(&attrs, "protocol"),
                        port,
                        ..Default::default()
                    });
                    if is_empty {
                        finish_port(&mut current_host, &mut current_port);
                    }
                }
                b"state" => {
                    if let Some(port) = current_port.as_mut() {
                        port.state = attr(&attrs, "state");
                        port.reason = attr(&attrs, "reason");
                    }
                }
                b"service" if current_port.is_some() => {
                    current_service = Some(ServiceInfo {
                        name: attr(&attrs, "name"),
                        product: attr(&attrs, "product"),
                        version: attr(&attrs, "version"),
                        extra_info: attr(&attrs, "extrainfo"),
                        cpe: Vec::new(),
                    });
                    if is_empty {
                        finish_service(&mut current_port, &mut current_service);
                    }
                }
                b"cpe" if current_service.is_some() && !is_empty => in_cpe = true,
                b"script" => {
                    if let Some(port) = current_port.as_mut() {
                        port.scripts
                            .insert(attr(&attrs, "id"), attr(&attrs, "output"));
                    } else if let Some(host) = current_host.as_mut() {
                        host.host_scripts
                            .insert(attr(&attrs, "id"), attr(&attrs, "output"));
                    }
                }
                b"osmatch" => {
                    if let Some(host) = current_host.as_mut() {
                        host.os_matches.push(OsMatch {
                            name: attr(&attrs, "name"),
                            accuracy: attr(&attrs, "accuracy").parse().unwrap_or(0),
                        });
                    }
                }
                b"finished" => {
                    result.stats.timestr = attr(&attrs, "timestr");
                    result.stats.elapsed = attr(&attrs, "elapsed");
                }
                b"hosts" => {
                    result.stats.up_hosts = attr(&attrs, "up").parse().unwrap_or(0);
                    result.stats.down_hosts = attr(&attrs, "down").parse().unwrap_or(0);
                    result.stats.total_hosts = attr(&attrs, "total").parse().unwrap_or(0);
                }
                _ => {}
            }
            continue;
        }

        match event {
            Event::Text(t) if in_cpe => {
                let text = t
                    .unescape()
                    .map_err(|e| ScanError::Parse(e.to_string()))?;
                if let Some(service) = current_service.as_mut() {
                    service.cpe.push(text.trim().to_string());
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"cpe" => in_cpe = false,
                b"service" => finish_service(&mut current_port, &mut current_service),
                b"port" => finish_port(&mut current_host, &mut current_port),
                b"host" => {
                    if let Some(host) = current_host.take() {
                        match host_key(&host) {
                            Some(key) => {
                                result.hosts.insert(key, host);
                            }
                            None => tracing::warn!("skipping nmap host entry without an address"),
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(ScanError::Parse("missing <nmaprun> root element".into()));
    }
    Ok(result)
}

fn finish_service(port: &mut Option<PortEntry>, service: &mut Option<ServiceInfo>) {
    if let (Some(p), Some(s)) = (port.as_mut(), service.take()) {
        p.service = Some(s);
    }
}

fn finish_port(host: &mut Option<HostResult>, port: &mut Option<PortEntry>) {
    if let (Some(h), Some(p)) = (host.as_mut(), port.take()) {
        h.ports.push(p);
    }
}

/// IP address if present, otherwise the MAC address.
fn host_key(host: &HostResult) -> Option<String> {
    ["ipv4", "ipv6", "mac"]
        .iter()
        .find_map(|kind| host.addresses.get(*kind).cloned())
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>, ScanError> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| ScanError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value()?.to_string();
        out.insert(key, value);
    }
    Ok(out)
}

fn attr(attrs: &HashMap<String, String>, key: &str) -> String {
    attrs.get(key).cloned().unwrap_or_default()
}
