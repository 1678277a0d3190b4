//! Import of the firmware-reported processor topology.
//!
//! The firmware tables themselves are parsed elsewhere; this module accepts
//! the already-decoded [`TopologySnapshot`], validates it, and derives the
//! lookup structures the bring-up code, the scheduler, and the load
//! balancer work with. The result is immutable after boot.

use alloc::vec::Vec;

use smallvec::SmallVec;
use thiserror::Error;

/// Sequential identifier of a logical CPU. The bootstrap processor is
/// always CPU 0.
pub type CpuId = u32;

/// Identifier the local APIC of a CPU answers to.
pub type ApicId = u32;

/// NUMA proximity-domain identifier.
pub type NodeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDescriptor {
	pub logical_id: CpuId,
	pub apic_id: ApicId,
	/// Processor UID from the firmware namespace.
	pub firmware_id: u32,
	pub enabled: bool,
	pub node: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicDescriptor {
	pub id: u8,
	/// Physical base of the MMIO register window.
	pub mmio_base: u64,
	/// First global interrupt this I/O APIC serves.
	pub gsi_base: u32,
	/// Number of redirection entries.
	pub redirections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
	ActiveHigh,
	ActiveLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
	Edge,
	Level,
}

/// Firmware remapping of a legacy ISA IRQ onto the global interrupt space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptOverride {
	pub legacy_irq: u8,
	pub gsi: u32,
	pub polarity: Polarity,
	pub trigger: TriggerMode,
}

/// Everything the firmware parser hands over, in one immutable record.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
	pub possible_cpus: u32,
	pub bsp_apic_id: ApicId,
	pub cpus: Vec<CpuDescriptor>,
	pub ioapics: Vec<IoApicDescriptor>,
	pub overrides: SmallVec<[InterruptOverride; 8]>,
	pub numa_nodes: u32,
	/// Row-major `numa_nodes * numa_nodes` distance matrix, self-distance
	/// on the diagonal.
	pub distances: Vec<u8>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
	#[error("two enabled processors share APIC id {0}")]
	DuplicateApicId(ApicId),
	#[error("running on APIC id {running}, but the firmware reports {reported} as bootstrap")]
	BspMismatch { reported: ApicId, running: ApicId },
	#[error("I/O APICs {0} and {1} serve overlapping interrupt ranges")]
	OverlappingGsiRanges(u8, u8),
	#[error("distance matrix does not cover {0} nodes")]
	TruncatedDistanceMatrix(u32),
}

/// The validated topology, plus the per-node migration fallback order.
#[derive(Debug)]
pub struct SystemTopology {
	snapshot: TopologySnapshot,
	/// For every node, the *other* nodes ordered by ascending distance
	/// (ties broken by node id). Consulted when a migration target on the
	/// local node is not available.
	fallback: Vec<Vec<NodeId>>,
}

impl SystemTopology {
	/// Validates `snapshot` and builds the derived lookup structures.
	/// `running_apic_id` is the APIC id of the processor executing this
	/// call, which must be the firmware-designated bootstrap processor.
	pub fn import(
		snapshot: TopologySnapshot,
		running_apic_id: ApicId,
	) -> Result<Self, TopologyError> {
		if snapshot.bsp_apic_id != running_apic_id {
			return Err(TopologyError::BspMismatch {
				reported: snapshot.bsp_apic_id,
				running: running_apic_id,
			});
		}

		for (i, cpu) in snapshot.cpus.iter().enumerate() {
			if !cpu.enabled {
				continue;
			}
			for other in &snapshot.cpus[i + 1..] {
				if other.enabled && other.apic_id == cpu.apic_id {
					return Err(TopologyError::DuplicateApicId(cpu.apic_id));
				}
			}
		}

		let mut ranges: Vec<&IoApicDescriptor> = snapshot.ioapics.iter().collect();
		ranges.sort_unstable_by_key(|ioapic| ioapic.gsi_base);
		for pair in ranges.windows(2) {
			if pair[0].gsi_base + pair[0].redirections > pair[1].gsi_base {
				return Err(TopologyError::OverlappingGsiRanges(pair[0].id, pair[1].id));
			}
		}

		let nodes = snapshot.numa_nodes.max(1);
		if (snapshot.distances.len() as u32) < nodes * nodes {
			return Err(TopologyError::TruncatedDistanceMatrix(nodes));
		}

		let mut fallback = Vec::with_capacity(nodes as usize);
		for node in 0..nodes {
			let mut others: Vec<NodeId> = (0..nodes).filter(|&other| other != node).collect();
			others.sort_unstable_by_key(|&other| (distance(&snapshot, node, other), other));
			fallback.push(others);
		}

		Ok(Self { snapshot, fallback })
	}

	pub fn possible_cpus(&self) -> u32 {
		self.snapshot.possible_cpus
	}

	pub fn bsp_apic_id(&self) -> ApicId {
		self.snapshot.bsp_apic_id
	}

	pub fn cpus(&self) -> &[CpuDescriptor] {
		&self.snapshot.cpus
	}

	/// Enabled processors other than the bootstrap processor, in boot
	/// order.
	pub fn secondary_cpus(&self) -> impl Iterator<Item = &CpuDescriptor> {
		self.snapshot
			.cpus
			.iter()
			.filter(|cpu| cpu.enabled && cpu.apic_id != self.snapshot.bsp_apic_id)
	}

	pub fn cpu(&self, id: CpuId) -> Option<&CpuDescriptor> {
		self.snapshot.cpus.iter().find(|cpu| cpu.logical_id == id)
	}

	pub fn ioapics(&self) -> &[IoApicDescriptor] {
		&self.snapshot.ioapics
	}

	/// The I/O APIC whose redirection range contains `gsi`.
	pub fn ioapic_for_gsi(&self, gsi: u32) -> Option<&IoApicDescriptor> {
		self.snapshot
			.ioapics
			.iter()
			.find(|ioapic| gsi >= ioapic.gsi_base && gsi < ioapic.gsi_base + ioapic.redirections)
	}

	/// Resolves a legacy ISA IRQ to its global interrupt and wiring. IRQs
	/// without an override are identity-mapped, active-high,
	/// edge-triggered.
	pub fn resolve_irq(&self, irq: u8) -> InterruptOverride {
		self.snapshot
			.overrides
			.iter()
			.copied()
			.find(|entry| entry.legacy_irq == irq)
			.unwrap_or(InterruptOverride {
				legacy_irq: irq,
				gsi: u32::from(irq),
				polarity: Polarity::ActiveHigh,
				trigger: TriggerMode::Edge,
			})
	}

	pub fn numa_nodes(&self) -> u32 {
		self.snapshot.numa_nodes.max(1)
	}

	pub fn distance(&self, from: NodeId, to: NodeId) -> u8 {
		distance(&self.snapshot, from, to)
	}

	/// Other nodes of `node`, nearest first.
	pub fn node_fallback(&self, node: NodeId) -> &[NodeId] {
		&self.fallback[node as usize]
	}

	/// The migration fallback order for `cpu`: the other nodes, nearest
	/// first.
	pub fn cpu_fallback(&self, cpu: CpuId) -> &[NodeId] {
		let node = self.cpu(cpu).map(|cpu| cpu.node).unwrap_or(0);
		self.node_fallback(node)
	}
}

fn distance(snapshot: &TopologySnapshot, from: NodeId, to: NodeId) -> u8 {
	let nodes = snapshot.numa_nodes.max(1);
	snapshot.distances[(from * nodes + to) as usize]
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cpu(logical_id: CpuId, apic_id: ApicId, node: NodeId) -> CpuDescriptor {
		CpuDescriptor {
			logical_id,
			apic_id,
			firmware_id: logical_id,
			enabled: true,
			node,
		}
	}

	fn snapshot() -> TopologySnapshot {
		TopologySnapshot {
			possible_cpus: 4,
			bsp_apic_id: 0,
			cpus: vec![cpu(0, 0, 0), cpu(1, 2, 0), cpu(2, 4, 1), cpu(3, 6, 1)],
			ioapics: vec![
				IoApicDescriptor {
					id: 0,
					mmio_base: 0xFEC0_0000,
					gsi_base: 0,
					redirections: 24,
				},
				IoApicDescriptor {
					id: 1,
					mmio_base: 0xFEC1_0000,
					gsi_base: 24,
					redirections: 8,
				},
			],
			overrides: SmallVec::from_slice(&[InterruptOverride {
				legacy_irq: 0,
				gsi: 2,
				polarity: Polarity::ActiveHigh,
				trigger: TriggerMode::Edge,
			}]),
			numa_nodes: 2,
			distances: vec![10, 20, 20, 10],
		}
	}

	#[test]
	fn import_accepts_sane_tables() {
		let topology = SystemTopology::import(snapshot(), 0).unwrap();
		assert_eq!(topology.possible_cpus(), 4);
		assert_eq!(topology.secondary_cpus().count(), 3);
		assert_eq!(topology.cpu(2).unwrap().apic_id, 4);
	}

	#[test]
	fn bsp_mismatch_rejected() {
		assert_eq!(
			SystemTopology::import(snapshot(), 2).unwrap_err(),
			TopologyError::BspMismatch {
				reported: 0,
				running: 2
			}
		);
	}

	#[test]
	fn duplicate_apic_id_rejected() {
		let mut tables = snapshot();
		tables.cpus[3].apic_id = 2;
		assert_eq!(
			SystemTopology::import(tables, 0).unwrap_err(),
			TopologyError::DuplicateApicId(2)
		);
	}

	#[test]
	fn duplicate_apic_id_tolerated_when_disabled() {
		let mut tables = snapshot();
		tables.cpus[3].apic_id = 2;
		tables.cpus[3].enabled = false;
		assert!(SystemTopology::import(tables, 0).is_ok());
	}

	#[test]
	fn overlapping_gsi_ranges_rejected() {
		let mut tables = snapshot();
		tables.ioapics[1].gsi_base = 20;
		assert_eq!(
			SystemTopology::import(tables, 0).unwrap_err(),
			TopologyError::OverlappingGsiRanges(0, 1)
		);
	}

	#[test]
	fn gsi_lookup_picks_covering_window() {
		let topology = SystemTopology::import(snapshot(), 0).unwrap();
		assert_eq!(topology.ioapic_for_gsi(5).unwrap().id, 0);
		assert_eq!(topology.ioapic_for_gsi(24).unwrap().id, 1);
		assert!(topology.ioapic_for_gsi(32).is_none());
	}

	#[test]
	fn irq_overrides_resolve() {
		let topology = SystemTopology::import(snapshot(), 0).unwrap();
		assert_eq!(topology.resolve_irq(0).gsi, 2);
		// No override: identity mapping.
		let plain = topology.resolve_irq(4);
		assert_eq!(plain.gsi, 4);
		assert_eq!(plain.trigger, TriggerMode::Edge);
	}

	#[test]
	fn fallback_sorted_by_distance_then_id() {
		let mut tables = snapshot();
		tables.numa_nodes = 3;
		tables.cpus[3].node = 2;
		// Node 0 is 30 away from node 1 and 20 away from node 2; node 1
		// and node 2 tie from each other's perspective.
		tables.distances = vec![10, 30, 20, 30, 10, 25, 20, 25, 10];
		let topology = SystemTopology::import(tables, 0).unwrap();
		assert_eq!(topology.node_fallback(0), &[2, 1]);
		assert_eq!(topology.node_fallback(1), &[2, 0]);
		assert_eq!(topology.node_fallback(2), &[0, 1]);
		// CPU 3 sits on node 2.
		assert_eq!(topology.cpu_fallback(3), &[0, 1]);
	}

	#[test]
	fn truncated_distance_matrix_rejected() {
		let mut tables = snapshot();
		tables.distances.pop();
		assert_eq!(
			SystemTopology::import(tables, 0).unwrap_err(),
			TopologyError::TruncatedDistanceMatrix(2)
		);
	}
}
