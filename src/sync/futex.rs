//! Cross-process futex park/wake on a 32-bit word
//!
//! The word lives in a `MAP_SHARED` mapping, so the non-private futex
//! operations are used: the kernel keys the wait queue on the physical page
//! and a wake from one process reaches waiters in every other process that
//! maps the same page. Targets without futexes fall back to a timed sleep.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Park on `word` while it still holds `expected`, for at most `timeout`
///
/// Spurious returns are allowed; callers always re-check the word.
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // EAGAIN (value changed), ETIMEDOUT and EINTR all mean "re-check"
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake every waiter parked on `word`, in any process
#[cfg(target_os = "linux")]
pub fn wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait(_word: &AtomicU32, _expected: u32, timeout: Duration) {
    std::thread::sleep(timeout);
}

#[cfg(not(target_os = "linux"))]
pub fn wake_all(_word: &AtomicU32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_returns_when_value_differs() {
        let word = AtomicU32::new(5);
        let start = Instant::now();
        wait(&word, 4, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_bounded_by_timeout() {
        let word = AtomicU32::new(1);
        let start = Instant::now();
        wait(&word, 1, Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(1));
        let waiter_word = word.clone();

        let waiter = thread::spawn(move || {
            while waiter_word.load(Ordering::Acquire) == 1 {
                wait(&waiter_word, 1, Duration::from_millis(50));
            }
        });

        thread::sleep(Duration::from_millis(10));
        word.store(0, Ordering::Release);
        wake_all(&word);
        waiter.join().unwrap();
    }
}
