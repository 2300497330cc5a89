// vm_traps/src/cpu/probe.rs

//! Per-OS sources of CPU identification.
//!
//! Linux reads `/proc/cpuinfo` and `AT_HWCAP`, FreeBSD reads MIDR through
//! the kernel's trap-and-emulate of `mrs` plus `elf_aux_info`, macOS asks
//! `sysctl`. Anything that cannot be determined falls back to
//! [`CpuIdentity::default`], no feature bits and [`PsrInfo::CONSERVATIVE`].

use super::{CpuFeatureSet, CpuFeatures, PsrInfo};

/// The identification fields of a Main ID Register.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CpuIdentity {
    pub implementer: u8,
    pub variant: u32,
    pub architecture: u32,
    pub model: u32,
    /// Part number of the second core type on big.LITTLE systems.
    pub model2: u32,
    pub revision: u32,
}

impl CpuIdentity {
    pub fn from_midr(midr: u64) -> Self {
        Self {
            implementer: ((midr >> 24) & 0xff) as u8,
            variant: ((midr >> 20) & 0xf) as u32,
            architecture: ((midr >> 16) & 0xf) as u32,
            model: ((midr >> 4) & 0xfff) as u32,
            model2: 0,
            revision: (midr & 0xf) as u32,
        }
    }
}

fn parse_number(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Extracts the CPU identity from the text of `/proc/cpuinfo`.
///
/// Every core is listed; the last part number becomes `model` and the one it
/// replaced, if different, becomes `model2`.
pub fn parse_cpuinfo(text: &str) -> CpuIdentity {
    let mut identity = CpuIdentity::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Some(value) = parse_number(value) else {
            continue;
        };
        match key.trim() {
            "CPU implementer" => identity.implementer = value as u8,
            "CPU variant" => identity.variant = value,
            "CPU architecture" => identity.architecture = value,
            "CPU revision" => identity.revision = value,
            "CPU part" => {
                if identity.model != value {
                    identity.model2 = identity.model;
                }
                identity.model = value;
            }
            _ => {}
        }
    }
    identity
}

#[cfg(target_arch = "aarch64")]
fn read_psr() -> PsrInfo {
    let ctr: u64;
    let dczid: u64;
    // Safety: both registers are readable from EL0.
    unsafe {
        core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mrs {}, dczid_el0", out(reg) dczid, options(nomem, nostack, preserves_flags));
    }
    PsrInfo {
        dczid_el0: dczid as u32,
        ctr_el0: ctr as u32,
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        fn identify() -> (CpuIdentity, CpuFeatures, PsrInfo) {
            let identity = std::fs::read_to_string("/proc/cpuinfo")
                .map(|text| parse_cpuinfo(&text))
                .unwrap_or_default();
            // Safety: getauxval has no preconditions.
            let hwcap = unsafe { libc::getauxval(libc::AT_HWCAP) };
            (identity, CpuFeatures::from_bits_truncate(hwcap as u32), read_psr())
        }
    } else if #[cfg(all(target_os = "freebsd", target_arch = "aarch64"))] {
        extern "C" {
            fn elf_aux_info(aux: libc::c_int, buf: *mut libc::c_void, buflen: libc::c_int) -> libc::c_int;
        }
        const AT_HWCAP: libc::c_int = 25;

        fn identify() -> (CpuIdentity, CpuFeatures, PsrInfo) {
            let midr: u64;
            // Safety: the kernel emulates EL0 reads of MIDR_EL1.
            unsafe {
                core::arch::asm!("mrs {}, midr_el1", out(reg) midr, options(nomem, nostack, preserves_flags));
            }
            let mut hwcap: libc::c_ulong = 0;
            // Safety: the buffer is a c_ulong and its size is passed along.
            let ret = unsafe {
                elf_aux_info(
                    AT_HWCAP,
                    (&mut hwcap as *mut libc::c_ulong).cast(),
                    core::mem::size_of::<libc::c_ulong>() as libc::c_int,
                )
            };
            if ret != 0 {
                hwcap = 0;
            }
            (CpuIdentity::from_midr(midr), CpuFeatures::from_bits_truncate(hwcap as u32), read_psr())
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
        fn sysctl_u64(name: &[u8]) -> Option<u64> {
            let mut value: u64 = 0;
            let mut size = core::mem::size_of::<u64>();
            // Safety: name is NUL-terminated and the out-buffer matches `size`.
            let ret = unsafe {
                libc::sysctlbyname(
                    name.as_ptr().cast(),
                    (&mut value as *mut u64).cast(),
                    &mut size,
                    core::ptr::null_mut(),
                    0,
                )
            };
            // Boolean entries come back as 32-bit ints.
            match (ret, size) {
                (0, 4) => Some(value & 0xffff_ffff),
                (0, _) => Some(value),
                _ => None,
            }
        }

        fn sysctl_flag(name: &[u8]) -> bool {
            sysctl_u64(name).map_or(false, |v| v != 0)
        }

        fn identify() -> (CpuIdentity, CpuFeatures, PsrInfo) {
            let mut features = CpuFeatures::empty();
            let table: [(&[u8], CpuFeatures); 6] = [
                (b"hw.optional.floatingpoint\0", CpuFeatures::FP),
                (b"hw.optional.neon\0", CpuFeatures::ASIMD),
                (b"hw.optional.arm.FEAT_AES\0", CpuFeatures::AES),
                (b"hw.optional.arm.FEAT_PMULL\0", CpuFeatures::PMULL),
                (b"hw.optional.armv8_crc32\0", CpuFeatures::CRC32),
                (b"hw.optional.armv8_1_atomics\0", CpuFeatures::LSE),
            ];
            for (name, flag) in table {
                if sysctl_flag(name) {
                    features |= flag;
                }
            }
            if sysctl_flag(b"hw.optional.arm.FEAT_SHA1\0") || sysctl_flag(b"hw.optional.armv8_2_sha3\0") {
                features |= CpuFeatures::SHA1 | CpuFeatures::SHA2;
            }

            let mut psr = read_psr();
            if let Some(line) = sysctl_u64(b"hw.cachelinesize\0").filter(|l| l.is_power_of_two() && *l >= 4) {
                let log2_words = (line / 4).trailing_zeros();
                psr.ctr_el0 = (psr.ctr_el0 & !0x000f_000f) | log2_words | (log2_words << 16);
            }

            let identity = CpuIdentity {
                implementer: b'a',
                ..CpuIdentity::default()
            };
            (identity, features, psr)
        }
    } else {
        // OpenBSD restricts the identification registers and non-aarch64
        // hosts have none; report the conservative defaults.
        fn identify() -> (CpuIdentity, CpuFeatures, PsrInfo) {
            (CpuIdentity::default(), CpuFeatures::empty(), PsrInfo::CONSERVATIVE)
        }
    }
}

pub(super) fn probe() -> CpuFeatureSet {
    let (identity, hwcap, psr) = identify();
    let set = CpuFeatureSet::from_parts(identity, hwcap, psr);
    crate::debug_print!("cpu probe: {}", set);
    set
}
