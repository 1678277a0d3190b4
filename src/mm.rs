//! Facade over the memory subsystem this core consumes. The physical-memory
//! allocator, page tables, and the kernel heap live outside this crate; the
//! scheduler and the SMP bring-up only ask for page blocks and for device
//! mappings through the small surface below.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::topology::NodeId;

pub const BASE_PAGE_SIZE: usize = 0x1000;

/// Offset of the direct physical-memory map installed by the boot loader.
/// `phys_to_virt` and `map_io` are linear translations through it.
static PHYSICAL_MEMORY_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn init(physical_memory_offset: u64) {
	PHYSICAL_MEMORY_OFFSET.store(physical_memory_offset, Ordering::Relaxed);
}

#[inline]
fn block_layout(order: u32) -> Layout {
	let size = BASE_PAGE_SIZE << order;
	unsafe { Layout::from_size_align_unchecked(size, BASE_PAGE_SIZE) }
}

/// Allocates `2^order` zeroed, contiguous pages.
pub fn alloc_pages(order: u32) -> Option<NonNull<u8>> {
	let layout = block_layout(order);
	NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
}

/// Allocates `2^order` zeroed pages, preferably backed by memory local to
/// `node`. The node is a placement hint; an embedder without per-node pools
/// serves the request from the global pool.
pub fn alloc_pages_node(order: u32, node: NodeId) -> Option<NonNull<u8>> {
	let _ = node;
	alloc_pages(order)
}

pub fn free_pages(ptr: NonNull<u8>, order: u32) {
	unsafe {
		alloc::alloc::dealloc(ptr.as_ptr(), block_layout(order));
	}
}

/// Smallest order whose block covers `size` bytes.
pub fn order_for(size: usize) -> u32 {
	let pages = size.div_ceil(BASE_PAGE_SIZE).next_power_of_two();
	pages.trailing_zeros()
}

/// Translates a physical address through the direct map.
#[inline]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
	(PHYSICAL_MEMORY_OFFSET.load(Ordering::Relaxed) + phys) as *mut u8
}

/// Translates a direct-mapped virtual address back to physical.
#[inline]
pub fn virt_to_phys(virt: *const u8) -> u64 {
	virt as u64 - PHYSICAL_MEMORY_OFFSET.load(Ordering::Relaxed)
}

/// Maps a device-memory window. The boot loader's direct map carries the
/// MMIO ranges uncached, so this is a translation, not a page-table edit.
#[inline]
pub fn map_io(phys: u64, _len: usize) -> *mut u8 {
	phys_to_virt(phys)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn orders() {
		assert_eq!(order_for(1), 0);
		assert_eq!(order_for(BASE_PAGE_SIZE), 0);
		assert_eq!(order_for(BASE_PAGE_SIZE + 1), 1);
		assert_eq!(order_for(0x4000), 2);
	}

	#[test]
	fn alloc_roundtrip() {
		let block = alloc_pages(2).unwrap();
		unsafe {
			assert_eq!(*block.as_ptr(), 0);
			block.as_ptr().write(0xA5);
		}
		free_pages(block, 2);
	}
}
