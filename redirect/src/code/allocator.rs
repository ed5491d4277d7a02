//! Anonymous pages for synthesized entry stubs.
//!
//! Pages start read+write so a stub can be emitted into them, and are then
//! flipped to read+execute. Nothing in the redirect path allocates: this is
//! support for building precode-shaped stubs with the `writer` modules, for
//! tests, benches and callers that fake entry points of their own.

use crate::error::{RedirectError, Result};

#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

impl CodeSlice {
    pub fn address(&self) -> usize {
        self.data as usize
    }
}

#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self { slab_size: page_size() }
    }
}

fn page_size() -> usize {
    #[cfg(unix)]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

#[cfg(target_os = "linux")]
fn os_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Free stretches of `[win_start, win_end)` between the sorted `regions`.
fn gaps(regions: &[(usize, usize)], win_start: usize, win_end: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut prev_end = win_start;
    for &(start, end) in regions {
        if start >= win_end {
            break;
        }
        if start > prev_end {
            out.push((prev_end, start));
        }
        prev_end = prev_end.max(end);
    }
    if prev_end < win_end {
        out.push((prev_end, win_end));
    }
    out
}

/// Page-aligned start for a `need`-byte block inside `gap`, as close to `near` as possible.
fn place_in_gap(gap: (usize, usize), near: usize, need: usize, page_sz: usize) -> Option<usize> {
    let (start, end) = gap;
    let first = (start + page_sz - 1) & !(page_sz - 1);
    let last = end.checked_sub(need)? & !(page_sz - 1);
    if last < first {
        return None;
    }
    Some((near & !(page_sz - 1)).clamp(first, last))
}

impl CodeAllocator {
    /// Allocate a read+write slab wherever the OS puts it.
    pub fn alloc_any(&mut self) -> Result<CodeSlice> {
        #[cfg(target_os = "macos")]
        unsafe {
            use mach2::kern_return::KERN_SUCCESS;
            use mach2::traps::mach_task_self;
            use mach2::vm::mach_vm_allocate;
            use mach2::vm_statistics::VM_FLAGS_ANYWHERE;

            let mut addr: u64 = 0;
            let kr = mach_vm_allocate(mach_task_self(), &mut addr, self.slab_size as u64, VM_FLAGS_ANYWHERE);
            if kr != KERN_SUCCESS {
                return Err(RedirectError::AllocationFailed { errno: kr });
            }
            Ok(CodeSlice { data: addr as *mut u8, size: self.slab_size })
        }

        #[cfg(target_os = "linux")]
        unsafe {
            self.mmap_at(core::ptr::null_mut(), 0)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Err(RedirectError::UnsupportedPlatform)
        }
    }

    /// Allocate a read+write slab lying entirely within `max_distance` bytes of `near`.
    ///
    /// Fails with `AllocationFailed` when no free stretch of the address space
    /// is close enough; callers that can live with a far slab fall back to
    /// [`alloc_any`](Self::alloc_any) themselves.
    pub fn alloc_near(&mut self, near: usize, max_distance: usize) -> Result<CodeSlice> {
        let page_sz = page_size();
        let need = self.slab_size;
        let win_start = near.saturating_sub(max_distance).max(page_sz);
        let win_end = near.saturating_add(max_distance).saturating_sub(need);
        if win_end <= win_start {
            return Err(RedirectError::AllocationFailed { errno: libc::ENOMEM });
        }

        let mut candidates: Vec<usize> = gaps(&self.mapped_regions()?, win_start, win_end + need)
            .into_iter()
            .filter_map(|gap| place_in_gap(gap, near, need, page_sz))
            .collect();
        candidates.sort_by_key(|&addr| addr.abs_diff(near));

        for candidate in candidates {
            if let Some(slice) = self.alloc_fixed(candidate) {
                return Ok(slice);
            }
        }
        Err(RedirectError::AllocationFailed { errno: libc::ENOMEM })
    }

    #[cfg(target_os = "linux")]
    fn mapped_regions(&self) -> Result<Vec<(usize, usize)>> {
        let maps = std::fs::read_to_string("/proc/self/maps").map_err(|e| {
            RedirectError::AllocationFailed {
                errno: e.raw_os_error().unwrap_or(0),
            }
        })?;
        let mut regions: Vec<(usize, usize)> = maps
            .lines()
            .filter_map(|line| {
                let (start, end) = line.split_whitespace().next()?.split_once('-')?;
                Some((
                    usize::from_str_radix(start, 16).ok()?,
                    usize::from_str_radix(end, 16).ok()?,
                ))
            })
            .collect();
        regions.sort_by_key(|&(start, _)| start);
        Ok(regions)
    }

    #[cfg(target_os = "macos")]
    fn mapped_regions(&self) -> Result<Vec<(usize, usize)>> {
        use mach2::kern_return::KERN_SUCCESS;
        use mach2::traps::mach_task_self;
        use mach2::vm::mach_vm_region;
        use mach2::vm_region::{vm_region_basic_info_64, vm_region_info_t, VM_REGION_BASIC_INFO_64};
        use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

        let mut regions = Vec::new();
        let mut addr: mach_vm_address_t = 0;
        unsafe {
            let task = mach_task_self();
            loop {
                let mut region_addr = addr;
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
                if kr != KERN_SUCCESS {
                    break;
                }
                let end = region_addr.saturating_add(region_size);
                regions.push((region_addr as usize, end as usize));
                addr = end;
            }
        }
        Ok(regions)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    fn mapped_regions(&self) -> Result<Vec<(usize, usize)>> {
        Err(RedirectError::UnsupportedPlatform)
    }

    #[cfg(target_os = "linux")]
    fn alloc_fixed(&self, addr: usize) -> Option<CodeSlice> {
        unsafe { self.mmap_at(addr as *mut libc::c_void, libc::MAP_FIXED_NOREPLACE).ok() }
    }

    #[cfg(target_os = "macos")]
    fn alloc_fixed(&self, addr: usize) -> Option<CodeSlice> {
        use mach2::kern_return::KERN_SUCCESS;
        use mach2::traps::mach_task_self;
        use mach2::vm::mach_vm_allocate;
        use mach2::vm_statistics::VM_FLAGS_FIXED;

        let mut out = addr as u64;
        let kr = unsafe { mach_vm_allocate(mach_task_self(), &mut out, self.slab_size as u64, VM_FLAGS_FIXED) };
        (kr == KERN_SUCCESS).then(|| CodeSlice { data: out as *mut u8, size: self.slab_size })
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    fn alloc_fixed(&self, _addr: usize) -> Option<CodeSlice> {
        None
    }

    #[cfg(target_os = "linux")]
    unsafe fn mmap_at(&self, hint: *mut libc::c_void, extra_flags: libc::c_int) -> Result<CodeSlice> {
        let ptr = libc::mmap(
            hint,
            self.slab_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(RedirectError::AllocationFailed { errno: os_errno() });
        }
        // Kernels before 4.17 ignore MAP_FIXED_NOREPLACE and treat the address as a hint.
        if !hint.is_null() && ptr != hint {
            libc::munmap(ptr, self.slab_size);
            return Err(RedirectError::AllocationFailed { errno: libc::EEXIST });
        }
        Ok(CodeSlice { data: ptr as *mut u8, size: self.slab_size })
    }

    /// Flip a slab to read+execute and flush it from the instruction cache.
    ///
    /// # Safety
    /// `slice` must come from this allocator and not be released.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<()> {
        #[cfg(target_os = "macos")]
        {
            use mach2::kern_return::KERN_SUCCESS;
            use mach2::traps::mach_task_self;
            use mach2::vm::mach_vm_protect;
            use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ};

            let kr = mach_vm_protect(
                mach_task_self(),
                slice.data as u64,
                slice.size as u64,
                0,
                VM_PROT_READ | VM_PROT_EXECUTE,
            );
            if kr != KERN_SUCCESS {
                return Err(RedirectError::MemoryProtection { address: slice.address(), errno: kr });
            }
        }

        #[cfg(target_os = "linux")]
        {
            if libc::mprotect(
                slice.data as *mut libc::c_void,
                slice.size,
                libc::PROT_READ | libc::PROT_EXEC,
            ) != 0
            {
                return Err(RedirectError::last_os_error(slice.address()));
            }
        }

        #[cfg(any(target_os = "macos", target_os = "linux"))]
        {
            crate::code::cache::invalidate_icache(slice.data, slice.size);
            Ok(())
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            let _ = slice;
            Err(RedirectError::UnsupportedPlatform)
        }
    }

    /// Unmap a slab. Anything still jumping into it will fault.
    ///
    /// # Safety
    /// No code may execute from, or hold pointers into, `slice` afterwards.
    pub unsafe fn release(&self, slice: CodeSlice) -> Result<()> {
        #[cfg(target_os = "macos")]
        {
            use mach2::kern_return::KERN_SUCCESS;
            use mach2::traps::mach_task_self;
            use mach2::vm::mach_vm_deallocate;

            let kr = mach_vm_deallocate(mach_task_self(), slice.data as u64, slice.size as u64);
            if kr != KERN_SUCCESS {
                return Err(RedirectError::MemoryProtection { address: slice.address(), errno: kr });
            }
            Ok(())
        }

        #[cfg(target_os = "linux")]
        {
            if libc::munmap(slice.data as *mut libc::c_void, slice.size) != 0 {
                return Err(RedirectError::last_os_error(slice.address()));
            }
            Ok(())
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            let _ = slice;
            Err(RedirectError::UnsupportedPlatform)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaps_between_sorted_regions() {
        let regions = [(0x1000, 0x3000), (0x5000, 0x6000), (0x6000, 0x9000)];
        assert_eq!(gaps(&regions, 0x0, 0xA000), vec![(0x0, 0x1000), (0x3000, 0x5000), (0x9000, 0xA000)]);
        assert_eq!(gaps(&regions, 0x2000, 0x5800), vec![(0x3000, 0x5000)]);
        assert!(gaps(&regions, 0x5000, 0x9000).is_empty());
    }

    #[test]
    fn placement_stays_inside_the_gap() {
        assert_eq!(place_in_gap((0x3000, 0x5000), 0x4800, 0x1000, 0x1000), Some(0x4000));
        assert_eq!(place_in_gap((0x3000, 0x5000), 0x1000, 0x1000, 0x1000), Some(0x3000));
        assert_eq!(place_in_gap((0x3000, 0x3800), 0x3000, 0x1000, 0x1000), None);
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn alloc_any_returns_executable_page() {
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");
        unsafe {
            #[cfg(target_arch = "aarch64")]
            (slice.data as *mut u32).write(0xD65F_03C0); // ret
            #[cfg(not(target_arch = "aarch64"))]
            slice.data.write(0xC3); // ret
            alloc.make_executable(&slice).expect("protect");
            alloc.release(slice).expect("release");
        }
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn alloc_near_returns_within_range() {
        let mut alloc = CodeAllocator::default();
        let near = alloc_near_returns_within_range as usize;
        let max_distance = 1024 * 1024 * 1024;
        let slice = alloc.alloc_near(near, max_distance).expect("alloc_near");
        assert!(slice.address().abs_diff(near) <= max_distance);
        assert!((slice.address() + slice.size).abs_diff(near) <= max_distance);
        unsafe { alloc.release(slice).expect("release") };
    }
}
