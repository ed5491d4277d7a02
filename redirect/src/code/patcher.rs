//! Writes into code pages and runtime-owned data pages.
//!
//! A `jmp rel32` displacement sits in a page the runtime maps read+execute,
//! while precode literal and indirection cells usually sit in data pages it
//! keeps writable. Writes therefore look up the current protection of every
//! page they touch, add write access only where it is missing, and put the
//! previous protection back afterwards.

use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{trace, warn};

use crate::code::cache::invalidate_icache;
use crate::error::{RedirectError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Protection {
    read: bool,
    write: bool,
    exec: bool,
}

/// A mapped range with uniform protection, clipped to the patch span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    start: usize,
    end: usize,
    prot: Protection,
}

#[cfg(target_os = "linux")]
mod os {
    use super::*;

    pub(super) fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Regions of `/proc/self/maps` overlapping `[start, end)`.
    pub(super) fn parse_maps(maps: &str, start: usize, end: usize) -> Vec<Region> {
        let mut out = Vec::new();
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let Some(range) = fields.next() else { continue };
            let Some(perms) = fields.next() else { continue };
            let Some((start_s, end_s)) = range.split_once('-') else { continue };
            let Ok(region_start) = usize::from_str_radix(start_s, 16) else { continue };
            let Ok(region_end) = usize::from_str_radix(end_s, 16) else { continue };
            if region_end <= start || region_start >= end {
                continue;
            }

            let perms = perms.as_bytes();
            out.push(Region {
                start: region_start.max(start),
                end: region_end.min(end),
                prot: Protection {
                    read: perms.first() == Some(&b'r'),
                    write: perms.get(1) == Some(&b'w'),
                    exec: perms.get(2) == Some(&b'x'),
                },
            });
        }
        out
    }

    pub(super) unsafe fn regions(start: usize, end: usize) -> Result<Vec<Region>> {
        let maps = std::fs::read_to_string("/proc/self/maps").map_err(|e| {
            RedirectError::MemoryProtection {
                address: start,
                errno: e.raw_os_error().unwrap_or(0),
            }
        })?;
        Ok(parse_maps(&maps, start, end))
    }

    fn native(prot: Protection) -> libc::c_int {
        let mut bits = libc::PROT_NONE;
        if prot.read {
            bits |= libc::PROT_READ;
        }
        if prot.write {
            bits |= libc::PROT_WRITE;
        }
        if prot.exec {
            bits |= libc::PROT_EXEC;
        }
        bits
    }

    pub(super) unsafe fn protect(region: &Region, prot: Protection) -> Result<()> {
        if libc::mprotect(
            region.start as *mut libc::c_void,
            region.end - region.start,
            native(prot),
        ) != 0
        {
            return Err(RedirectError::last_os_error(region.start));
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
mod os {
    use super::*;

    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::{mach_vm_protect, mach_vm_region};
    use mach2::vm_prot::{vm_prot_t, VM_PROT_COPY, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    use mach2::vm_region::{vm_region_basic_info_64, vm_region_info_t, VM_REGION_BASIC_INFO_64};
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

    pub(super) fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn native(prot: Protection) -> vm_prot_t {
        let mut bits = 0;
        if prot.read {
            bits |= VM_PROT_READ;
        }
        if prot.write {
            bits |= VM_PROT_WRITE;
        }
        if prot.exec {
            bits |= VM_PROT_EXECUTE;
        }
        bits
    }

    pub(super) unsafe fn regions(start: usize, end: usize) -> Result<Vec<Region>> {
        let task = mach_task_self();
        let mut out = Vec::new();
        let mut cursor = start;

        while cursor < end {
            let mut region_addr = cursor as mach_vm_address_t;
            let mut region_size: mach_vm_size_t = 0;
            let mut info: vm_region_basic_info_64 = core::mem::zeroed();
            let mut info_count = vm_region_basic_info_64::count();
            let mut object_name: u32 = 0;

            let kr = mach_vm_region(
                task,
                &mut region_addr,
                &mut region_size,
                VM_REGION_BASIC_INFO_64,
                (&mut info as *mut _) as vm_region_info_t,
                &mut info_count,
                &mut object_name,
            );
            // mach_vm_region skips forward over holes; a hole inside the span is unmapped memory.
            if kr != KERN_SUCCESS || region_addr as usize > cursor {
                return Err(RedirectError::MemoryProtection { address: cursor, errno: kr });
            }

            let region_end = (region_addr + region_size) as usize;
            out.push(Region {
                start: cursor,
                end: region_end.min(end),
                prot: Protection {
                    read: info.protection & VM_PROT_READ != 0,
                    write: info.protection & VM_PROT_WRITE != 0,
                    exec: info.protection & VM_PROT_EXECUTE != 0,
                },
            });
            cursor = region_end;
        }
        Ok(out)
    }

    pub(super) unsafe fn protect(region: &Region, prot: Protection) -> Result<()> {
        let task = mach_task_self();
        let address = region.start as mach_vm_address_t;
        let size = (region.end - region.start) as mach_vm_size_t;

        let mut kr = mach_vm_protect(task, address, size, 0, native(prot));
        if kr != KERN_SUCCESS && prot.write {
            // Shared-cache and copy-on-write mappings need a private copy first.
            kr = mach_vm_protect(task, address, size, 0, native(prot) | VM_PROT_COPY);
        }
        if kr != KERN_SUCCESS && prot.write && prot.exec {
            // W^X enforced: drop execute for the duration of the write.
            kr = mach_vm_protect(task, address, size, 0, native(Protection { exec: false, ..prot }));
        }
        if kr != KERN_SUCCESS {
            return Err(RedirectError::MemoryProtection { address: region.start, errno: kr });
        }
        Ok(())
    }
}

/// Patch `size` bytes at `addr` through `apply`.
///
/// Pages that are not writable are unlocked for the duration of `apply` and
/// restored afterwards; executable pages get their instruction cache flushed.
///
/// # Safety
/// `addr` must point to `size` bytes of mapped memory. `apply` must write within that range.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<()> {
    if size == 0 {
        return Ok(());
    }

    let page_sz = os::page_size();
    let page_start = (addr as usize) & !(page_sz - 1);
    let page_end = ((addr as usize) + size + page_sz - 1) & !(page_sz - 1);

    let regions = os::regions(page_start, page_end)?;
    let mapped: usize = regions.iter().map(|r| r.end - r.start).sum();
    if mapped != page_end - page_start {
        return Err(RedirectError::MemoryProtection {
            address: addr as usize,
            errno: libc::EFAULT,
        });
    }

    let locked: Vec<Region> = regions.iter().copied().filter(|r| !r.prot.write).collect();
    for (i, region) in locked.iter().enumerate() {
        let writable = Protection {
            read: true,
            write: true,
            ..region.prot
        };
        if let Err(e) = os::protect(region, writable) {
            restore(&locked[..i]);
            return Err(e);
        }
        trace!("Unlocked {:#x}..{:#x} for patching", region.start, region.end);
    }

    apply(addr);

    restore(&locked);

    // Flush the whole span after restoring protection, not just the patched bytes.
    if regions.iter().any(|r| r.prot.exec) {
        invalidate_icache(page_start as *mut u8, page_end - page_start);
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
unsafe fn restore(regions: &[Region]) {
    for region in regions {
        if let Err(e) = os::protect(region, region.prot) {
            warn!("Failed to restore protection of {:#x}..{:#x}: {}", region.start, region.end, e);
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<()> {
    let _ = (addr, size, apply);
    Err(RedirectError::UnsupportedPlatform)
}

/// Overwrite the 4-byte little-endian value at `addr`.
///
/// # Safety
/// `addr` must point to 4 mapped bytes nobody else relies on being stable.
pub unsafe fn write_i32(addr: usize, value: i32) -> Result<()> {
    patch_code(addr as *mut u8, size_of::<i32>(), |p| {
        (p as *mut i32).write_unaligned(value.to_le());
    })
}

/// Overwrite the pointer-sized cell at `addr`.
///
/// A naturally aligned cell is replaced with one atomic store, so a thread
/// jumping through it sees either the old or the new target.
///
/// # Safety
/// `addr` must point to a mapped pointer-sized cell.
pub unsafe fn write_pointer(addr: usize, value: usize) -> Result<()> {
    patch_code(addr as *mut u8, size_of::<usize>(), |p| {
        if (p as usize) % align_of::<AtomicUsize>() == 0 {
            (*(p as *const AtomicUsize)).store(value.to_le(), Ordering::SeqCst);
        } else {
            (p as *mut usize).write_unaligned(value.to_le());
        }
    })
}
