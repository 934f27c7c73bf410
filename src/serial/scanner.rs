use std::sync::Arc;

use super::{Result, SerialBackend, SerialDeviceInfo, SerialError, VendorProductFilter};

/// Enumerates serial ports, optionally narrowed to the macropad's USB identity.
///
/// Stateless apart from the backend handle and filter; every call is one OS
/// enumeration, so it is safe to call from the supervisory timer at high frequency.
#[derive(Clone)]
pub struct PortScanner {
    backend: Arc<dyn SerialBackend>,
    filter: Option<VendorProductFilter>,
}

impl PortScanner {
    pub fn new(backend: Arc<dyn SerialBackend>, filter: Option<VendorProductFilter>) -> Self {
        Self { backend, filter }
    }

    pub fn filter(&self) -> Option<VendorProductFilter> {
        self.filter
    }

    /// Ordered candidate ports for the configured filter.
    pub fn list_candidates(&self) -> Result<Vec<String>> {
        self.list_candidates_with(self.filter.as_ref())
    }

    /// Ordered candidate ports. If the filter matches at least one port only the
    /// matches are returned; otherwise the unfiltered list is returned so discovery
    /// still works when the OS exposes no identity metadata.
    pub fn list_candidates_with(&self, filter: Option<&VendorProductFilter>) -> Result<Vec<String>> {
        let ports = self.enumerate()?;

        if let Some(filter) = filter {
            let matches: Vec<String> = ports
                .iter()
                .filter(|info| filter.matches(info))
                .map(|info| info.port_name.clone())
                .collect();

            if !matches.is_empty() {
                log::debug!("Identity filter {:04X}:{:04X} matched {:?}", filter.vid, filter.pid, matches);
                return Ok(matches);
            }
            log::debug!("Identity filter matched nothing, falling back to all {} ports", ports.len());
        }

        Ok(ports.into_iter().map(|info| info.port_name).collect())
    }

    /// Every visible port name, ignoring the filter.
    pub fn port_names(&self) -> Result<Vec<String>> {
        Ok(self.enumerate()?.into_iter().map(|info| info.port_name).collect())
    }

    /// Full enumeration records, ignoring the filter.
    pub fn enumerate(&self) -> Result<Vec<SerialDeviceInfo>> {
        self.backend
            .available_ports()
            .map_err(|e| match e {
                SerialError::PortUnavailable(_) => e,
                other => SerialError::PortUnavailable(format!("Port enumeration failed: {}", other)),
            })
    }

    pub fn backend(&self) -> &Arc<dyn SerialBackend> {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::sim::SimBackend;

    fn scanner_with(ports: Vec<SerialDeviceInfo>, filter: Option<VendorProductFilter>) -> PortScanner {
        let backend = SimBackend::new();
        for port in ports {
            backend.attach_port(port);
        }
        PortScanner::new(Arc::new(backend), filter)
    }

    #[test]
    fn returns_only_matches_when_filter_hits() {
        let scanner = scanner_with(
            vec![
                SerialDeviceInfo::bare("COM1"),
                SerialDeviceInfo::usb("COM3", 0x303A, 0x80D7),
                SerialDeviceInfo::usb("COM4", 0x10C4, 0xEA60),
            ],
            Some(VendorProductFilter::default()),
        );
        assert_eq!(scanner.list_candidates().unwrap(), vec!["COM3".to_string()]);
    }

    #[test]
    fn falls_back_to_all_ports_without_identity_match() {
        let scanner = scanner_with(
            vec![SerialDeviceInfo::bare("COM1"), SerialDeviceInfo::usb("COM4", 0x10C4, 0xEA60)],
            Some(VendorProductFilter::default()),
        );
        assert_eq!(
            scanner.list_candidates().unwrap(),
            vec!["COM1".to_string(), "COM4".to_string()]
        );
    }

    #[test]
    fn empty_enumeration_is_not_an_error() {
        let scanner = scanner_with(Vec::new(), None);
        assert!(scanner.list_candidates().unwrap().is_empty());
    }

    #[test]
    fn enumeration_failure_maps_to_port_unavailable() {
        let backend = SimBackend::new();
        backend.fail_enumeration(true);
        let scanner = PortScanner::new(Arc::new(backend), None);
        assert!(matches!(scanner.port_names(), Err(SerialError::PortUnavailable(_))));
    }
}
