//! Page-table construction
//!
//! Builds 4-level AArch64 translation tables (4 KiB granule, 48-bit VA) out
//! of frames obtained from the [`AllocationManager`]. Tables only grow: there
//! is no unmap and no permission change.
//!
//! Descriptors hold physical addresses. Software reaches a table through the
//! manager's [`KernelView`] of that address.

pub mod descriptor;
pub mod table;


pub use descriptor::{Descriptor, DescriptorKind, MapKind, PageFlags};
pub use table::{
    canonical, table_index, table_indices, PageTable, ENTRIES_PER_TABLE, LEVELS, LEVEL_SHIFTS,
};

use zerocopy::FromZeroes;

use crate::config::{FRAME_SIZE, MAIR_IDX_DEVICE_NGNRNE};
use crate::error::MemoryError;
use crate::memory::manager::AllocationManager;
use crate::memory::{KernelView, PhysAddr, VirtAddr};

/// Physical address of a root translation table, as loaded into a TTBR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHandle(PhysAddr);

impl TableHandle {
    pub fn phys(self) -> PhysAddr {
        self.0
    }

    /// Adopt an existing root table
    ///
    /// # Safety
    /// `pa` must be a frame-aligned translation table whose whole tree is
    /// reachable through the kernel view of the manager it is used with.
    pub unsafe fn from_phys(pa: PhysAddr) -> Self {
        Self(pa)
    }
}

/// # Safety
/// `pa` must be a live translation table reachable through `view`, not
/// otherwise borrowed for `'t`.
unsafe fn table_at<'t>(view: KernelView, pa: PhysAddr) -> &'t mut PageTable {
    &mut *view.to_kernel(pa).as_mut_ptr::<PageTable>()
}

/// Shared view of a table for the read-only walkers
///
/// # Safety
/// `pa` must be a live translation table reachable through `view`, not
/// mutably borrowed for `'t`.
unsafe fn table_ref<'t>(view: KernelView, pa: PhysAddr) -> &'t PageTable {
    &*view.to_kernel(pa).as_ptr::<PageTable>()
}

/// Make descriptor writes visible to the table walker
#[inline]
fn publish_tables() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("dsb ish", "isb");
    }
}

/// Allocate an empty translation table
pub fn create_table(manager: &mut AllocationManager) -> Result<TableHandle, MemoryError> {
    let va = manager.allocate(FRAME_SIZE)?;
    let pa = manager.kernel_view().to_phys(va);
    // A frame-sized allocation is a whole buddy frame, so it is frame aligned
    // and exclusively ours.
    unsafe { table_at(manager.kernel_view(), pa) }.zero();
    log::trace!("vmm: new table at {}", pa);
    Ok(TableHandle(pa))
}

/// Back `va` with a fresh zeroed page in the tree rooted at `root`.
///
/// Missing intermediate tables are created on the way down. Returns the
/// kernel-view address of the new page. Halts if a table or the page cannot
/// be allocated, or if a block mapping sits on the path.
pub fn map(
    manager: &mut AllocationManager,
    root: TableHandle,
    va: VirtAddr,
    kind: MapKind,
) -> VirtAddr {
    let view = manager.kernel_view();
    let indices = table_indices(va);

    let mut table_pa = root.phys();
    for level in 0..LEVELS - 1 {
        let table = unsafe { table_at(view, table_pa) };
        let entry = table[indices[level]];
        table_pa = match entry.kind(level) {
            DescriptorKind::Table => entry.address(),
            DescriptorKind::Invalid => {
                let next = create_table(manager).unwrap_or_else(|err| {
                    crate::fatal!("map {}: no table for level {}: {}", va, level + 1, err)
                });
                table[indices[level]] = Descriptor::table(next.phys());
                next.phys()
            }
            other => crate::fatal!("map {}: {:?} descriptor at level {}", va, other, level),
        };
    }

    let page = manager
        .allocate(FRAME_SIZE)
        .unwrap_or_else(|err| crate::fatal!("map {}: no leaf page: {}", va, err));
    unsafe { core::ptr::write_bytes(page.as_mut_ptr::<u8>(), 0, FRAME_SIZE) };

    let leaf = unsafe { table_at(view, table_pa) };
    let slot = &mut leaf[indices[LEVELS - 1]];
    if slot.is_valid() {
        log::warn!("vmm: {} already mapped by {:?}, replacing", va, slot);
    }
    *slot = Descriptor::page(view.to_phys(page), kind);
    publish_tables();

    log::debug!("vmm: mapped {} -> {} ({:?})", va, view.to_phys(page), kind);
    page
}

/// [`map`] with a mapping kind code coming from outside the crate.
///
/// Halts on an unknown code.
pub fn map_raw(
    manager: &mut AllocationManager,
    root: TableHandle,
    va: VirtAddr,
    raw_kind: u32,
) -> VirtAddr {
    let kind = MapKind::try_from(raw_kind)
        .unwrap_or_else(|raw| crate::fatal!("map {}: unknown map kind {}", va, raw));
    map(manager, root, va, kind)
}

/// Descriptor indexing `va` at `level`, or `None` if the walk stops earlier
pub fn lookup_entry(
    manager: &AllocationManager,
    root: TableHandle,
    va: VirtAddr,
    level: usize,
) -> Option<Descriptor> {
    if level >= LEVELS {
        return None;
    }
    let view = manager.kernel_view();
    let indices = table_indices(va);
    let mut table_pa = root.phys();
    for (depth, &index) in indices.iter().enumerate().take(level) {
        let entry = unsafe { table_ref(view, table_pa) }[index];
        if entry.kind(depth) != DescriptorKind::Table {
            return None;
        }
        table_pa = entry.address();
    }
    Some(unsafe { table_ref(view, table_pa) }[indices[level]])
}

/// Physical address `va` translates to, with the attributes of its mapping
pub fn translate(
    manager: &AllocationManager,
    root: TableHandle,
    va: VirtAddr,
) -> Option<(PhysAddr, PageFlags)> {
    let view = manager.kernel_view();
    let mut table_pa = root.phys();
    for level in 0..LEVELS {
        let entry = unsafe { table_ref(view, table_pa) }[table_index(va, level)];
        match entry.kind(level) {
            DescriptorKind::Table => table_pa = entry.address(),
            DescriptorKind::Block | DescriptorKind::Page => {
                let offset = va.as_usize() & ((1 << LEVEL_SHIFTS[level]) - 1);
                let base = entry.address().as_usize() & !((1 << LEVEL_SHIFTS[level]) - 1);
                return Some((PhysAddr::new(base + offset), entry.flags()));
            }
            DescriptorKind::Invalid => return None,
        }
    }
    None
}

/// Visit every leaf (block or page) of the tree rooted at `root`
pub fn walk(
    manager: &AllocationManager,
    root: TableHandle,
    visit: &mut dyn FnMut(VirtAddr, PhysAddr, PageFlags),
) {
    walk_level(manager.kernel_view(), root.phys(), 0, 0, visit);
}

fn walk_level(
    view: KernelView,
    table_pa: PhysAddr,
    level: usize,
    base: usize,
    visit: &mut dyn FnMut(VirtAddr, PhysAddr, PageFlags),
) {
    let table = unsafe { table_ref(view, table_pa) };
    for (index, entry) in table.iter() {
        let va = base | (index << LEVEL_SHIFTS[level]);
        match entry.kind(level) {
            DescriptorKind::Table => walk_level(view, entry.address(), level + 1, va, visit),
            DescriptorKind::Block | DescriptorKind::Page => {
                visit(canonical(va), entry.address(), entry.flags())
            }
            DescriptorKind::Invalid => {}
        }
    }
}

/// Log every leaf mapping of the tree rooted at `root`
pub fn dump_page_table(manager: &AllocationManager, root: TableHandle) {
    log::info!("vmm: page table dump for root {}", root.phys());
    walk(manager, root, &mut |va, pa, flags| {
        let writable = if flags.contains(PageFlags::AP_RO) { '-' } else { 'W' };
        let user = if flags.contains(PageFlags::AP_EL0) { 'U' } else { 'K' };
        let user_exec = if flags.contains(PageFlags::UXN) { '-' } else { 'X' };
        let device = if flags.attr_index() == MAIR_IDX_DEVICE_NGNRNE { 'D' } else { 'N' };
        log::info!(
            "  VA: 0x{:016X} -> PA: 0x{:016X} [R{}{}{}{}]",
            va.as_usize(),
            pa.as_usize(),
            writable,
            user_exec,
            user,
            device
        );
    });
}
