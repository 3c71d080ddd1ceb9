//! Libvirt domain XML parsing into an immutable [`GuestConfig`].
//!
//! Parsed with `roxmltree`, which builds a borrowed, read-only DOM — a
//! natural fit for a document that is parsed once per hook call and then
//! discarded.

use std::collections::BTreeSet;

use roxmltree::{Document, Node};
use tracing::warn;

use crate::error::ConfigError;
use crate::model::{parse_cpuset, parse_memory, GuestConfig, PciAddress};

const AKEYDO_NS: &str = "https://dev.akeydo/xmlns/libvirt/domain/1.0";
const QEMU_NS: &str = "http://libvirt.org/schemas/domain/qemu/1.0";

/// Parses a libvirt domain XML document into a [`GuestConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::Xml`] if the document cannot be parsed at all, and
/// [`ConfigError::InvalidConfig`] if the document has no `<name>` element.
/// Every other field is best-effort: a missing or malformed value takes its
/// empty default rather than failing the parse.
pub fn parse_guest_config(xml: &str) -> Result<GuestConfig, ConfigError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();

    let name = root
        .descendants()
        .find(|n| n.has_tag_name("name"))
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::InvalidConfig {
            reason: "missing <name> element".to_string(),
        })?
        .to_string();

    let memory_bytes = parse_memory_element(&root);
    let hugepages_backed = root
        .descendants()
        .any(|n| n.has_tag_name("memoryBacking"))
        && root.descendants().any(|n| n.has_tag_name("hugepages"));
    let pinned_cpus = parse_pinned_cpus(&root);
    let pci_devices = parse_pci_devices(&root);
    let evdev_paths = parse_evdev_paths(&root, &name);
    let hotkey = parse_hotkey(&root);

    Ok(GuestConfig {
        name,
        memory_bytes,
        hugepages_backed,
        pinned_cpus,
        pci_devices,
        evdev_paths,
        hotkey,
    })
}

fn parse_memory_element(root: &Node) -> u64 {
    let Some(mem) = root.descendants().find(|n| n.has_tag_name("memory")) else {
        return 0;
    };
    let Some(value) = mem.text().and_then(|t| t.trim().parse::<u64>().ok()) else {
        return 0;
    };
    parse_memory(value, mem.attribute("unit"))
}

fn parse_pinned_cpus(root: &Node) -> BTreeSet<u32> {
    root.descendants()
        .filter(|n| n.has_tag_name("vcpupin"))
        .filter_map(|n| n.attribute("cpuset"))
        .flat_map(parse_cpuset)
        .collect()
}

fn parse_pci_devices(root: &Node) -> BTreeSet<PciAddress> {
    root.descendants()
        .filter(|n| n.has_tag_name("hostdev") && n.attribute("type") == Some("pci"))
        .filter_map(|hostdev| {
            hostdev
                .descendants()
                .find(|n| n.has_tag_name("address"))
        })
        .filter_map(parse_pci_address)
        .collect()
}

fn parse_pci_address(addr: Node) -> Option<PciAddress> {
    let attr = |name: &str| -> Option<u64> {
        let raw = addr.attribute(name).unwrap_or("0");
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        u64::from_str_radix(raw, 16).ok()
    };
    Some(PciAddress {
        domain: attr("domain")? as u16,
        bus: attr("bus")? as u8,
        slot: attr("slot")? as u8,
        function: attr("function")? as u8,
    })
}

fn parse_evdev_paths(root: &Node, name: &str) -> BTreeSet<String> {
    let prefix = format!("/dev/input/by-id/{name}-");
    let mut paths = passthrough_evdev_paths(root, &prefix);
    paths.extend(qemu_arg_evdev_paths(root, &prefix));
    paths
}

fn passthrough_evdev_paths(root: &Node, prefix: &str) -> BTreeSet<String> {
    root.descendants()
        .filter(|n| n.has_tag_name("input") && n.attribute("type") == Some("passthrough"))
        .filter_map(|input| input.descendants().find(|n| n.has_tag_name("source")))
        .filter_map(|source| source.attribute("evdev"))
        .filter(|dev| dev.starts_with(prefix))
        .map(str::to_string)
        .collect()
}

fn qemu_arg_evdev_paths(root: &Node, prefix: &str) -> BTreeSet<String> {
    root.descendants()
        .filter(|n| n.has_tag_name("arg") && n.tag_name().namespace() == Some(QEMU_NS))
        .filter_map(|n| n.attribute("value"))
        .flat_map(|value| value.split(',').map(str::to_string).collect::<Vec<_>>())
        .filter_map(|token| token.strip_prefix("evdev=").map(str::to_string))
        .filter(|dev| dev.starts_with(prefix))
        .collect()
}

fn parse_hotkey(root: &Node) -> Option<crate::model::Chord> {
    let settings = root
        .descendants()
        .find(|n| n.has_tag_name("settings") && n.tag_name().namespace() == Some(AKEYDO_NS))?;
    let hotkey = settings
        .children()
        .find(|n| n.has_tag_name("hotkey") && n.tag_name().namespace() == Some(AKEYDO_NS))?;
    let keys: Vec<&str> = hotkey
        .children()
        .filter(|n| n.has_tag_name("key") && n.tag_name().namespace() == Some(AKEYDO_NS))
        .filter_map(|n| n.attribute("value"))
        .collect();
    if keys.is_empty() {
        warn!("<akeydo:hotkey> present but contains no <akeydo:key> elements");
    }
    crate::keycode::parse_chord(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_DOMAIN: &str = r#"
        <domain type='kvm'>
          <name>win10</name>
          <memory unit='GiB'>4</memory>
          <memoryBacking><hugepages/></memoryBacking>
          <cputune>
            <vcpupin vcpu='0' cpuset='2-3'/>
            <vcpupin vcpu='1' cpuset='5'/>
          </cputune>
          <devices>
            <input type='passthrough'>
              <source evdev='/dev/input/by-id/win10-kbd'/>
            </input>
            <input type='passthrough'>
              <source evdev='/dev/input/by-id/other-mouse'/>
            </input>
            <hostdev mode='subsystem' type='pci' managed='yes'>
              <source>
                <address domain='0x0000' bus='0x01' slot='0x00' function='0x0'/>
              </source>
            </hostdev>
          </devices>
        </domain>
    "#;

    #[test]
    fn parses_name_memory_cpus_pci_evdev() {
        let cfg = parse_guest_config(BASE_DOMAIN).unwrap();
        assert_eq!(cfg.name, "win10");
        assert_eq!(cfg.memory_bytes, 4 * 1024 * 1024 * 1024);
        assert!(cfg.hugepages_backed);
        assert_eq!(
            cfg.pinned_cpus,
            [2, 3, 5].into_iter().collect::<BTreeSet<u32>>()
        );
        assert_eq!(
            cfg.pci_devices,
            [PciAddress { domain: 0, bus: 1, slot: 0, function: 0 }]
                .into_iter()
                .collect::<BTreeSet<_>>()
        );
        // Only the device prefixed "win10-" is retained; "other-mouse" is dropped.
        assert_eq!(
            cfg.evdev_paths,
            ["/dev/input/by-id/win10-kbd".to_string()]
                .into_iter()
                .collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn missing_name_is_invalid_config() {
        let err = parse_guest_config("<domain><memory>100</memory></domain>").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig { .. }));
    }

    #[test]
    fn malformed_xml_is_xml_error() {
        let err = parse_guest_config("<domain><name>oops</name").unwrap_err();
        assert!(matches!(err, ConfigError::Xml(_)));
    }

    #[test]
    fn qemu_commandline_evdev_is_parsed() {
        let xml = r#"
            <domain xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>
              <name>legacy</name>
              <qemu:commandline>
                <qemu:arg value='-device'/>
                <qemu:arg value='input-linux,evdev=/dev/input/by-id/legacy-kbd,grab_all=on'/>
              </qemu:commandline>
            </domain>
        "#;
        let cfg = parse_guest_config(xml).unwrap();
        assert_eq!(
            cfg.evdev_paths,
            ["/dev/input/by-id/legacy-kbd".to_string()]
                .into_iter()
                .collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn hotkey_is_parsed_from_akeydo_namespace() {
        let xml = r#"
            <domain xmlns:akeydo='https://dev.akeydo/xmlns/libvirt/domain/1.0'>
              <name>win10</name>
              <metadata>
                <akeydo:settings>
                  <akeydo:hotkey>
                    <akeydo:key value='KEY_LEFTCTRL'/>
                    <akeydo:key value='KEY_LEFTALT'/>
                    <akeydo:key value='KEY_KP1'/>
                  </akeydo:hotkey>
                </akeydo:settings>
              </metadata>
            </domain>
        "#;
        let cfg = parse_guest_config(xml).unwrap();
        assert_eq!(cfg.hotkey.unwrap().keys().count(), 3);
    }

    #[test]
    fn absent_optional_fields_are_empty_defaults() {
        let cfg = parse_guest_config("<domain><name>bare</name></domain>").unwrap();
        assert_eq!(cfg.memory_bytes, 0);
        assert!(!cfg.hugepages_backed);
        assert!(cfg.pinned_cpus.is_empty());
        assert!(cfg.pci_devices.is_empty());
        assert!(cfg.evdev_paths.is_empty());
        assert!(cfg.hotkey.is_none());
    }
}
