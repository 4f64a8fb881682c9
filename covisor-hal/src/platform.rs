//! Platform-description tree
//!
//! At boot the firmware hands the hypervisor a tree of device nodes. The
//! core walks it looking for coprocessor candidates and resolves the
//! symbolic aliases used by the `dom0_coprocs` boot value. Parsing the
//! flattened blob itself happens before this crate is entered; the types
//! here model the already-decoded view.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

/// Property marking a device node as a virtualizable coprocessor.
pub const COPROC_PROPERTY: &str = "xen,coproc";

/// One memory-mapped I/O window occupied by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioWindow {
    pub addr: u64,
    pub size: u64,
}

/// A single node of the platform description.
#[derive(Debug, Clone)]
pub struct DtNode {
    path: String,
    compatibles: Vec<String>,
    properties: Vec<(String, Vec<u8>)>,
    mmios: Vec<MmioWindow>,
    irqs: Vec<u32>,
}

impl DtNode {
    pub fn new(path: &str) -> Self {
        DtNode {
            path: String::from(path),
            compatibles: Vec::new(),
            properties: Vec::new(),
            mmios: Vec::new(),
            irqs: Vec::new(),
        }
    }

    pub fn with_compatible(mut self, compat: &str) -> Self {
        self.compatibles.push(String::from(compat));
        self
    }

    pub fn with_property(mut self, name: &str, value: &[u8]) -> Self {
        self.properties.push((String::from(name), Vec::from(value)));
        self
    }

    pub fn with_mmio(mut self, addr: u64, size: u64) -> Self {
        self.mmios.push(MmioWindow { addr, size });
        self
    }

    pub fn with_irq(mut self, irq: u32) -> Self {
        self.irqs.push(irq);
        self
    }

    /// Full name of the node; the canonical path used as primary key.
    pub fn full_name(&self) -> &str {
        &self.path
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|(n, _)| n == name)
    }

    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn is_compatible(&self, compat: &str) -> bool {
        self.compatibles.iter().any(|c| c == compat)
    }

    pub fn mmios(&self) -> &[MmioWindow] {
        &self.mmios
    }

    pub fn irqs(&self) -> &[u32] {
        &self.irqs
    }
}

/// The decoded platform description: nodes plus the alias table.
#[derive(Debug, Default)]
pub struct DeviceTree {
    nodes: Vec<DtNode>,
    aliases: BTreeMap<String, String>,
}

impl DeviceTree {
    pub fn new() -> Self {
        DeviceTree { nodes: Vec::new(), aliases: BTreeMap::new() }
    }

    pub fn add_node(&mut self, node: DtNode) {
        self.nodes.push(node);
    }

    /// Record `alias` as a shorthand for the node at `path`.
    pub fn add_alias(&mut self, alias: &str, path: &str) {
        self.aliases.insert(String::from(alias), String::from(path));
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DtNode> {
        self.nodes.iter()
    }

    pub fn find_node_by_path(&self, path: &str) -> Option<&DtNode> {
        self.nodes.iter().find(|n| n.path == path)
    }

    pub fn find_node_by_alias(&self, alias: &str) -> Option<&DtNode> {
        let path = self.aliases.get(alias)?;
        self.find_node_by_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolves_to_node() {
        let mut dt = DeviceTree::new();
        dt.add_node(DtNode::new("/soc/gpu@fd000000").with_property(COPROC_PROPERTY, &[]));
        dt.add_alias("gpu0", "/soc/gpu@fd000000");

        let node = dt.find_node_by_alias("gpu0").unwrap();
        assert_eq!(node.full_name(), "/soc/gpu@fd000000");
        assert!(node.has_property(COPROC_PROPERTY));
        assert!(dt.find_node_by_alias("gpu1").is_none());
    }

    #[test]
    fn node_resources() {
        let node = DtNode::new("/soc/dsp@e6000000")
            .with_compatible("vendor_xxx,coproc_xxx")
            .with_mmio(0xe600_0000, 0x1000)
            .with_irq(119);
        assert!(node.is_compatible("vendor_xxx,coproc_xxx"));
        assert_eq!(node.mmios(), &[MmioWindow { addr: 0xe600_0000, size: 0x1000 }]);
        assert_eq!(node.irqs(), &[119]);
    }
}
