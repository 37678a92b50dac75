//! Disk probing module using lsblk.
//!
//! This module turns the block topology reported for one device path into a
//! [`DeviceDescriptor`], or decides that the device must be left alone because
//! it is not a plain SCSI/libATA disk (RAID members, LVM volumes, ...).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::Host;

/// One entry of the block topology of a device, as reported by lsblk.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct BlockEntry {
    /// Kernel name (e.g., "sda", "sda1").
    pub kname: String,
    /// Drive model; only set on the whole-disk entry.
    #[serde(default)]
    pub model: Option<String>,
    /// Filesystem label.
    #[serde(default)]
    pub label: Option<String>,
    /// Partition label (GPT name).
    #[serde(default)]
    pub partlabel: Option<String>,
    /// Human readable size (e.g., "32G").
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: String,
}

/// A partition discovered while probing a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    /// Kernel name of the partition, used as the mount source `/dev/<kname>`.
    pub kname: String,
    /// Sanitized display name, used as the mount directory name.
    pub name: String,
}

/// Everything the prober learned about a manageable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    /// Sanitized display name of the whole disk.
    pub name: String,
    /// Partitions keyed by their numeric kernel-name suffix.
    pub partitions: BTreeMap<u32, PartitionInfo>,
}

/// Result of probing a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Probe {
    /// The device is a simple disk and can be mounted.
    Disk(DeviceDescriptor),
    /// The device contains a volume this tool does not manage.
    Skip {
        /// Kernel name of the first entry that failed classification.
        kname: String,
    },
}

/// lsblk prints sizes as text unless `--bytes` is given; accept both.
fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Text(String),
        Bytes(u64),
    }

    Ok(match Option::<Size>::deserialize(deserializer)? {
        Some(Size::Text(text)) => text,
        Some(Size::Bytes(bytes)) => bytes.to_string(),
        None => String::new(),
    })
}

/// Raw JSON node from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkNode {
    #[serde(flatten)]
    entry: BlockEntry,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkNode>,
}

/// Parses the JSON printed by `lsblk -J` into a flat list of entries.
///
/// Depending on the lsblk version partitions are listed either next to their
/// disk or nested under `children`; both layouts are accepted.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockEntry>> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    let mut entries = Vec::new();
    collect_entries(output.blockdevices, &mut entries);
    Ok(entries)
}

/// Recursively collect entries from lsblk output, including children (partitions).
fn collect_entries(nodes: Vec<LsblkNode>, entries: &mut Vec<BlockEntry>) {
    for node in nodes {
        entries.push(node.entry);
        collect_entries(node.children, entries);
    }
}

/// Replaces every run of characters outside `[A-Za-z0-9._-]` with one `_`.
///
/// Example: `"Myshiny USB - #me"` becomes `"Myshiny_USB_-_me"`.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Returns true if `kname` is a SCSI/libATA disk or one of its partitions
/// (`sda`, `sdb4`, `sdaa12`, ...).
pub fn is_simple_disk(kname: &str) -> bool {
    let Some(rest) = kname.strip_prefix("sd") else {
        return false;
    };
    let letters = rest.bytes().take_while(u8::is_ascii_lowercase).count();
    letters > 0 && rest[letters..].bytes().all(|b| b.is_ascii_digit())
}

/// Returns the numeric suffix of a kernel name (`sdb4` -> 4).
fn partition_number(kname: &str) -> Option<u32> {
    let digits = kname.len() - kname.bytes().rev().take_while(u8::is_ascii_digit).count();
    kname[digits..].parse().ok()
}

/// Joins a name and a size into a sanitized display name.
fn display_name(base: &str, size: &str) -> String {
    sanitize(&format!("{}_{}", base.trim(), size.trim()))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Classifies block entries of one device.
///
/// If any entry is not a simple disk the whole device is skipped. Otherwise
/// the whole-disk entry names the device (model, else kernel name) and every
/// numbered entry becomes a partition named after its filesystem label, else
/// its partition label, else its kernel name, suffixed with its size.
pub fn classify(device_id: &str, entries: &[BlockEntry]) -> Probe {
    if let Some(foreign) = entries.iter().find(|e| !is_simple_disk(&e.kname)) {
        return Probe::Skip {
            kname: foreign.kname.clone(),
        };
    }

    let mut name = None;
    let mut partitions = BTreeMap::new();
    for entry in entries {
        let number = partition_number(&entry.kname);
        match (non_empty(&entry.model), number) {
            (Some(model), _) => name = Some(display_name(model, &entry.size)),
            (None, None) => name = Some(display_name(&entry.kname, &entry.size)),
            (None, Some(number)) => {
                let base = non_empty(&entry.label)
                    .or_else(|| non_empty(&entry.partlabel))
                    .unwrap_or(&entry.kname);
                partitions.insert(
                    number,
                    PartitionInfo {
                        kname: entry.kname.clone(),
                        name: display_name(base, &entry.size),
                    },
                );
            }
        }
    }

    Probe::Disk(DeviceDescriptor {
        name: name.unwrap_or_else(|| sanitize(device_id)),
        partitions,
    })
}

/// Queries the block topology of `device_dir/<device_id>` and classifies it.
pub fn probe(host: &dyn Host, device_dir: &Path, device_id: &str) -> Result<Probe> {
    let entries = host.list_blocks(&device_dir.join(device_id))?;
    Ok(classify(device_id, &entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LSBLK_JSON: &str = r#"{
        "blockdevices": [
            {"kname": "sdb", "model": "Cruzer Blade", "label": null, "partlabel": null, "size": "32G"},
            {"kname": "sdb1", "model": null, "label": "Vac Photos", "partlabel": null, "size": "32G"},
            {"kname": "sdb2", "model": null, "label": null, "partlabel": "linux data", "size": "1G"},
            {"kname": "sdb3", "model": null, "label": null, "partlabel": null, "size": "512M"}
        ]
    }"#;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Myshiny USB - #me"), "Myshiny_USB_-_me");
        assert_eq!(sanitize("Vac Photos_32G"), "Vac_Photos_32G");
        assert_eq!(sanitize("a//\\\\b"), "a_b");
        assert_eq!(sanitize("keep.these-chars_ok"), "keep.these-chars_ok");
        assert_eq!(sanitize("Ünïcødé"), "_n_c_d_");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn test_sanitize_idempotent() {
        for input in ["", "  ", "a b  c", "#!@", "x:y/z", "ok", "Ä_b"] {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn test_is_simple_disk() {
        assert!(is_simple_disk("sda"));
        assert!(is_simple_disk("sdb4"));
        assert!(is_simple_disk("sdz15"));
        assert!(is_simple_disk("sdaa2"));
        assert!(!is_simple_disk("sd"));
        assert!(!is_simple_disk("sd1"));
        assert!(!is_simple_disk("md0"));
        assert!(!is_simple_disk("dm-3"));
        assert!(!is_simple_disk("nvme0n1p1"));
        assert!(!is_simple_disk("sda1p"));
    }

    #[test]
    fn test_parse_lsblk_json() {
        let entries = parse_lsblk(SAMPLE_LSBLK_JSON).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].model.as_deref(), Some("Cruzer Blade"));
        assert_eq!(entries[1].label.as_deref(), Some("Vac Photos"));
        assert_eq!(entries[3].size, "512M");
    }

    #[test]
    fn test_parse_lsblk_nested_and_numeric_size() {
        let json = r#"{"blockdevices": [
            {"kname": "sdc", "model": "Disk", "size": 1024, "children": [
                {"kname": "sdc1", "model": null, "label": "A", "partlabel": null, "size": 512}
            ]}
        ]}"#;
        let entries = parse_lsblk(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].size, "1024");
        assert_eq!(entries[1].kname, "sdc1");
    }

    #[test]
    fn test_parse_lsblk_garbage() {
        assert!(matches!(
            parse_lsblk("not json"),
            Err(Error::LsblkParse { .. })
        ));
    }

    #[test]
    fn test_classify_names() {
        let entries = parse_lsblk(SAMPLE_LSBLK_JSON).unwrap();
        let Probe::Disk(descriptor) = classify("pci-0000:00:14.0-usb-0:1:1.0-scsi-0:0:0:0", &entries)
        else {
            panic!("expected a disk");
        };

        assert_eq!(descriptor.name, "Cruzer_Blade_32G");
        assert_eq!(descriptor.partitions.len(), 3);
        assert_eq!(descriptor.partitions[&1].name, "Vac_Photos_32G");
        assert_eq!(descriptor.partitions[&1].kname, "sdb1");
        assert_eq!(descriptor.partitions[&2].name, "linux_data_1G");
        assert_eq!(descriptor.partitions[&3].name, "sdb3_512M");
    }

    #[test]
    fn test_classify_skips_composite_volumes() {
        let entries = vec![
            BlockEntry {
                kname: "sdd".into(),
                model: Some("Raid Member".into()),
                size: "1T".into(),
                ..Default::default()
            },
            BlockEntry {
                kname: "md127".into(),
                size: "1T".into(),
                ..Default::default()
            },
        ];
        assert_eq!(
            classify("some-id", &entries),
            Probe::Skip {
                kname: "md127".into()
            }
        );
    }

    #[test]
    fn test_classify_fallback_names() {
        let entries = vec![
            BlockEntry {
                kname: "sde".into(),
                model: None,
                size: "8G".into(),
                ..Default::default()
            },
            BlockEntry {
                kname: "sde1".into(),
                label: Some("   ".into()),
                size: "8G".into(),
                ..Default::default()
            },
        ];
        let Probe::Disk(descriptor) = classify("id", &entries) else {
            panic!("expected a disk");
        };
        assert_eq!(descriptor.name, "sde_8G");
        assert_eq!(descriptor.partitions[&1].name, "sde1_8G");

        let Probe::Disk(descriptor) = classify("usb:0 1", &entries[1..]) else {
            panic!("expected a disk");
        };
        assert_eq!(descriptor.name, "usb_0_1");
    }
}
