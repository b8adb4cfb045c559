//! Cycle clock used to time every intercepted wait.
//!
//! [`now()`] returns raw hardware ticks. The values are only meaningful
//! relative to other readings taken during the same run on the same machine;
//! readings from different cores may be skewed by a small, bounded amount.

/// Read the hardware cycle counter.
///
/// On `x86_64` this is `rdtscp`, which waits for all preceding instructions to
/// execute before reading the counter, so a reading taken right before a
/// blocking call cannot drift into it.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn now() -> u64 {
    let mut aux = 0u32;
    // SAFETY: `rdtscp` has no memory side effects beyond writing `aux`.
    unsafe { core::arch::x86_64::__rdtscp(&mut aux) }
}

/// Read the virtual counter (`cntvct_el0`).
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn now() -> u64 {
    let val: u64;
    // `isb` keeps the read from being hoisted above earlier instructions.
    unsafe { core::arch::asm!("isb", "mrs {}, cntvct_el0", out(reg) val, options(nostack)) };
    val
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("lockprof needs a hardware cycle counter (x86_64 `rdtscp` or aarch64 `cntvct_el0`)");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_on_one_thread() {
        let mut last = now();
        for _ in 0..10_000 {
            let next = now();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn advances_across_sleep() {
        let before = now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(now() > before);
    }
}
