use lazy_static::lazy_static;

use crate::target::Arch;

#[cfg(target_arch = "x86_64")]
lazy_static! {
    static ref HAS_AVX2: bool = is_x86_feature_detected!("avx2");
    static ref HAS_POPCNT: bool = is_x86_feature_detected!("popcnt");
}

#[cfg(target_arch = "x86_64")]
pub fn has_avx2() -> bool {
    *HAS_AVX2
}

#[cfg(target_arch = "x86_64")]
pub fn has_popcnt() -> bool {
    *HAS_POPCNT
}

/// Process-wide emission configuration. Built once before any method is
/// compiled and read-only afterwards; per-method contexts only borrow it.
#[derive(Clone, Debug)]
pub struct EmitConfig {
    pub arch: Arch,

    /// Widest usable SIMD register in bytes (16 or 32).
    pub simd_width: usize,

    /// False for debuggable code: scope boundaries then follow the
    /// lexical block table instead of liveness.
    pub opts_enabled: bool,

    /// Emit offset-keyed annotations for disassembly dumps.
    pub emit_comments: bool,
}

impl EmitConfig {
    pub fn new(arch: Arch) -> EmitConfig {
        EmitConfig {
            arch,
            simd_width: 16,
            opts_enabled: true,
            emit_comments: false,
        }
    }

    /// Configuration for the architecture this process runs on.
    pub fn detect() -> EmitConfig {
        #[cfg(target_arch = "x86_64")]
        {
            let mut config = EmitConfig::new(Arch::X64);
            if has_avx2() {
                config.simd_width = 32;
            }
            config
        }

        #[cfg(target_arch = "aarch64")]
        {
            EmitConfig::new(Arch::Arm64)
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            panic!("unsupported host architecture");
        }
    }

    pub fn debuggable(arch: Arch) -> EmitConfig {
        let mut config = EmitConfig::new(arch);
        config.opts_enabled = false;
        config.emit_comments = true;
        config
    }

    pub fn ptr_width(&self) -> usize {
        8
    }
}
