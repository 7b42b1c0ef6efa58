// =============================================================================
// nimbus kernel — Memory Subsystem
// =============================================================================
//
// The memory subsystem manages all physical and virtual memory in the kernel.
// It's organized into layers, each depending only on the ones above it:
//
//   address.rs  — PhysAddr/VirtAddr newtypes (type safety for addresses)
//   pmm.rs      — Physical Memory Manager (bitmap allocator for frames)
//   vmm.rs      — Virtual Memory Manager (page table operations)
//   vma.rs      — Virtual Memory Arena (per-address-space region tracking)
//   heap.rs     — Kernel heap allocator (Box, Vec, etc.), built on vma
//
// This module only exposes what's needed. Internal details stay private.
// =============================================================================

pub mod address;
pub mod heap;
pub mod pmm;
pub mod vma;
pub mod vmm;

