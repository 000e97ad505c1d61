//! File-backed hardware records.
//!
//! Each host is one JSON file named after its dashed lowercase MAC
//! (`aa-bb-cc-dd-ee-ff.json`) in a flat directory. Useful for labs and for
//! tests; production deployments plug in their own [`BackendReader`].

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use macaddr::MacAddr6;

use super::{BackendError, BackendReader, HardwareRecord};

pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, mac: MacAddr6) -> PathBuf {
        let name = format!("{}", mac)
            .to_lowercase()
            .replace(':', "-");
        self.dir.join(format!("{name}.json"))
    }

    async fn load(&self, path: PathBuf, key: &str) -> Result<HardwareRecord, BackendError> {
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(key.to_string()));
            }
            Err(e) => return Err(BackendError::Read { path, source: e }),
        };

        serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::Malformed(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl BackendReader for FileBackend {
    async fn get_by_mac(&self, mac: MacAddr6) -> Result<HardwareRecord, BackendError> {
        self.load(self.record_path(mac), &mac.to_string()).await
    }

    async fn get_by_ip(&self, ip: IpAddr) -> Result<HardwareRecord, BackendError> {
        let IpAddr::V4(ip) = ip else {
            return Err(BackendError::NotFound(ip.to_string()));
        };

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| BackendError::Read {
                path: self.dir.clone(),
                source: e,
            })?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| BackendError::Read {
            path: self.dir.clone(),
            source: e,
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load(path.clone(), &ip.to_string()).await {
                Ok(record) if record.dhcp.ip == Some(ip) => return Ok(record),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("skipping unreadable record {}: {e}", path.display());
                }
            }
        }

        Err(BackendError::NotFound(ip.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn write_record(dir: &std::path::Path, name: &str, json: &str) {
        std::fs::write(dir.join(name), json).unwrap();
    }

    #[tokio::test]
    async fn get_by_mac_loads_record() {
        let dir = tempfile::tempdir().unwrap();
        write_record(
            dir.path(),
            "01-02-03-04-05-06.json",
            r#"{
                "dhcp": {"ip": "192.168.1.100", "hostname": "node01"},
                "netboot": {"allow_netboot": true}
            }"#,
        );

        let backend = FileBackend::new(dir.path());
        let mac = MacAddr6::new(0x01, 0x02, 0x03, 0x04, 0x05, 0x06);
        let record = backend.get_by_mac(mac).await.unwrap();

        assert_eq!(record.dhcp.ip, Some(Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(record.dhcp.hostname.as_deref(), Some("node01"));
        assert!(record.netboot.allow_netboot);
        // unset lease falls back to the default
        assert_eq!(record.dhcp.lease_time_secs, 86400);
    }

    #[tokio::test]
    async fn get_by_mac_not_found_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        let mac = MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);

        let err = backend.get_by_mac(mac).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn get_by_ip_scans_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_record(
            dir.path(),
            "01-02-03-04-05-06.json",
            r#"{"dhcp": {"ip": "10.0.0.7"}}"#,
        );
        write_record(
            dir.path(),
            "0a-0b-0c-0d-0e-0f.json",
            r#"{"dhcp": {"ip": "10.0.0.8"}}"#,
        );

        let backend = FileBackend::new(dir.path());
        let record = backend
            .get_by_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)))
            .await
            .unwrap();
        assert_eq!(record.dhcp.ip, Some(Ipv4Addr::new(10, 0, 0, 8)));

        let err = backend
            .get_by_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn malformed_record_is_not_a_not_found() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), "01-02-03-04-05-06.json", "{not json");

        let backend = FileBackend::new(dir.path());
        let mac = MacAddr6::new(0x01, 0x02, 0x03, 0x04, 0x05, 0x06);
        let err = backend.get_by_mac(mac).await.unwrap_err();
        assert!(!err.is_not_found());
    }
}
