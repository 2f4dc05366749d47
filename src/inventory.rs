//! Reading the hypervisor's VM inventory.
//!
//! Workstation keeps registered VMs in `inventory.vmls`, a flat list of
//! `vmlistN.<field> = "value"` lines. Each VM's `.vmx` descriptor uses the
//! same `key = "value"` syntax and carries the `displayName`. VMs that were
//! cloned or copied under the VM root but never opened in the UI are not in
//! the inventory; those are discovered by scanning the root one level deep.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConvergeError;
use crate::vm_state::VmDescriptor;

/// One `vmlistN` block from the inventory that points at a `.vmx` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub config: PathBuf,
    pub display_name: Option<String>,
}

/// Parse `key = "value"` lines. Comments, blank lines and lines without `=`
/// are skipped. Values are unquoted and `|XX` hex escapes decoded.
pub fn parse_kv(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let (key, value) = l.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.trim().to_string(), decode_escapes(value)))
        })
        .collect()
}

/// VMware escapes special characters as `|` followed by two hex digits, one
/// escape per UTF-8 byte.
fn decode_escapes(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'|'
            && let Some(&[hi, lo]) = bytes.get(i + 1..i + 3)
            && let (Some(hi), Some(lo)) = (hex_digit(hi), hex_digit(lo))
        {
            out.push(hi << 4 | lo);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

fn is_vmx(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("vmx"))
}

/// Extract the VM entries from `inventory.vmls` contents, in file order.
/// Folder entries (whose `config` is not a `.vmx` path) are skipped.
pub fn parse_inventory(contents: &str) -> Vec<InventoryEntry> {
    let mut blocks: BTreeMap<u32, (Option<String>, Option<String>)> = BTreeMap::new();

    for (key, value) in parse_kv(contents) {
        let Some(rest) = key.strip_prefix("vmlist") else {
            continue;
        };
        let Some((index, field)) = rest.split_once('.') else {
            continue;
        };
        let Ok(index) = index.parse::<u32>() else {
            continue;
        };
        let block = blocks.entry(index).or_default();
        match field {
            "config" => block.0 = Some(value),
            "DisplayName" => block.1 = Some(value).filter(|v| !v.is_empty()),
            _ => {}
        }
    }

    blocks
        .into_values()
        .filter_map(|(config, display_name)| {
            let config = PathBuf::from(config?);
            is_vmx(&config).then_some(InventoryEntry {
                config,
                display_name,
            })
        })
        .collect()
}

/// The `displayName` key of a `.vmx` descriptor.
pub fn vmx_display_name(contents: &str) -> Option<String> {
    parse_kv(contents)
        .into_iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("displayName"))
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

fn file_stem_name(config: &Path) -> String {
    config
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

async fn descriptor_name(config: &Path, hint: Option<String>) -> String {
    if let Some(name) = hint {
        return name;
    }
    match tokio::fs::read_to_string(config).await {
        Ok(contents) => vmx_display_name(&contents).unwrap_or_else(|| file_stem_name(config)),
        Err(_) => file_stem_name(config),
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, ConvergeError> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConvergeError::Io {
            context: format!("reading {}", path.display()),
            source: e,
        }),
    }
}

/// `.vmx` files exactly one directory below `vm_root`.
pub async fn scan_vm_root(vm_root: &Path) -> Result<Vec<PathBuf>, ConvergeError> {
    let io_err = |e: std::io::Error| ConvergeError::Io {
        context: format!("scanning {}", vm_root.display()),
        source: e,
    };

    let mut found = Vec::new();
    let mut dirs = match tokio::fs::read_dir(vm_root).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(io_err(e)),
    };

    while let Some(entry) = dirs.next_entry().await.map_err(io_err)? {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Ok(mut files) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(file)) = files.next_entry().await {
            let path = file.path();
            if is_vmx(&path) && path.is_file() {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Every VM the registry can see: inventory entries first (registered),
/// then descriptors under `vm_root` that the inventory does not mention.
/// `running` is left `false`; the caller fills it in.
pub async fn load(inventory: &Path, vm_root: &Path) -> Result<Vec<VmDescriptor>, ConvergeError> {
    let entries = match read_optional(inventory).await? {
        Some(contents) => parse_inventory(&contents),
        None => Vec::new(),
    };

    let mut vms = Vec::with_capacity(entries.len());
    for entry in entries {
        let exists = entry.config.is_file();
        let name = descriptor_name(&entry.config, entry.display_name).await;
        vms.push(VmDescriptor {
            name,
            exists,
            registered: true,
            running: false,
            config: entry.config,
        });
    }

    for config in scan_vm_root(vm_root).await? {
        if vms.iter().any(|vm| vm.config == config) {
            continue;
        }
        let name = descriptor_name(&config, None).await;
        vms.push(VmDescriptor {
            name,
            exists: true,
            registered: false,
            running: false,
            config,
        });
    }

    Ok(vms)
}

/// Find the VM called `name`. Known entries win over unknown ones; unknown
/// entries are only considered when `include_unknown` is set.
pub fn find(vms: &[VmDescriptor], name: &str, include_unknown: bool) -> Option<VmDescriptor> {
    let mut matches = vms.iter().filter(|vm| vm.name == name);
    let known = matches.clone().find(|vm| vm.is_known());
    match known {
        Some(vm) => Some(vm.clone()),
        None if include_unknown => matches.next().cloned(),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
.encoding = "UTF-8"
vmlist1.config = "/home/u/vmware/web01/web01.vmx"
vmlist1.DisplayName = "web01"
vmlist1.ParentID = "0"
vmlist2.config = "folder0"
vmlist2.Type = "2"
vmlist2.DisplayName = "My Folder"
vmlist3.config = "/home/u/vmware/db/db.vmx"
vmlist3.DisplayName = ""
index0.field0.name = "guestOS"
"#;

    #[test]
    fn parse_inventory_skips_folders() {
        let entries = parse_inventory(INVENTORY);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].config, PathBuf::from("/home/u/vmware/web01/web01.vmx"));
        assert_eq!(entries[0].display_name.as_deref(), Some("web01"));
        assert_eq!(entries[1].display_name, None);
    }

    #[test]
    fn parse_inventory_orders_by_index() {
        let entries = parse_inventory(
            "vmlist10.config = \"/b.vmx\"\nvmlist2.config = \"/a.vmx\"\n",
        );
        let configs: Vec<_> = entries.iter().map(|e| e.config.clone()).collect();
        assert_eq!(configs, vec![PathBuf::from("/a.vmx"), PathBuf::from("/b.vmx")]);
    }

    #[test]
    fn vmx_display_name_is_case_insensitive() {
        let vmx = "config.version = \"8\"\nDisplayName = \"Ubuntu 64-bit\"\n";
        assert_eq!(vmx_display_name(vmx).as_deref(), Some("Ubuntu 64-bit"));
    }

    #[test]
    fn escapes_are_decoded() {
        let kv = parse_kv("displayName = \"a|22b|7Cc\"");
        assert_eq!(kv[0].1, "a\"b|c");
    }

    #[test]
    fn lone_pipe_is_kept() {
        let kv = parse_kv("displayName = \"a|zz\"");
        assert_eq!(kv[0].1, "a|zz");
    }

    #[test]
    fn escaped_utf8_sequences_decode_as_one_char() {
        let kv = parse_kv("displayName = \"caf|C3|A9\"");
        assert_eq!(kv[0].1, "caf\u{e9}");
    }

    #[test]
    fn signed_hex_is_not_an_escape() {
        let kv = parse_kv("displayName = \"a|+1b\"");
        assert_eq!(kv[0].1, "a|+1b");
    }

    #[test]
    fn trailing_pipe_is_kept() {
        let kv = parse_kv("displayName = \"a|2\"");
        assert_eq!(kv[0].1, "a|2");
    }

    fn vm(name: &str, registered: bool, exists: bool) -> VmDescriptor {
        VmDescriptor {
            name: name.into(),
            config: PathBuf::from(format!("/vms/{name}-{registered}-{exists}.vmx")),
            exists,
            registered,
            running: false,
        }
    }

    #[test]
    fn find_excludes_unknown_by_default() {
        let vms = vec![vm("a", false, true), vm("b", true, false)];
        assert!(find(&vms, "a", false).is_none());
        assert!(find(&vms, "b", false).is_none());
        assert!(find(&vms, "a", true).is_some());
        assert!(find(&vms, "b", true).is_some());
    }

    #[test]
    fn find_prefers_known_entries() {
        let vms = vec![vm("a", false, true), vm("a", true, true)];
        let found = find(&vms, "a", true).unwrap();
        assert!(found.registered);
    }

    #[tokio::test]
    async fn load_merges_inventory_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vmware");
        std::fs::create_dir_all(root.join("web01")).unwrap();
        std::fs::create_dir_all(root.join("stray")).unwrap();
        let web = root.join("web01").join("web01.vmx");
        std::fs::write(&web, "displayName = \"web01\"\n").unwrap();
        std::fs::write(root.join("stray").join("stray.vmx"), "displayName = \"Stray VM\"\n")
            .unwrap();
        std::fs::write(root.join("notes.txt"), "not a vm").unwrap();

        let inventory = dir.path().join("inventory.vmls");
        std::fs::write(
            &inventory,
            format!(
                "vmlist1.config = \"{}\"\nvmlist2.config = \"{}\"\nvmlist2.DisplayName = \"gone\"\n",
                web.display(),
                root.join("gone").join("gone.vmx").display()
            ),
        )
        .unwrap();

        let vms = load(&inventory, &root).await.unwrap();
        assert_eq!(vms.len(), 3);

        let web01 = find(&vms, "web01", false).unwrap();
        assert!(web01.registered && web01.exists);

        assert!(find(&vms, "gone", false).is_none());
        let gone = find(&vms, "gone", true).unwrap();
        assert!(gone.registered && !gone.exists);

        let stray = find(&vms, "Stray VM", true).unwrap();
        assert!(!stray.registered && stray.exists);
    }

    #[tokio::test]
    async fn load_tolerates_missing_inventory_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let vms = load(&dir.path().join("none.vmls"), &dir.path().join("none"))
            .await
            .unwrap();
        assert!(vms.is_empty());
    }
}
