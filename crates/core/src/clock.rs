//! 시간 추상화
//!
//! 재시도 backoff와 graceful shutdown 단계 계산은 모두 [`Clock`]을 통해
//! 시간을 읽고 대기합니다. 테스트에서는 수동으로 진행시키는 clock을 주입합니다.

use std::time::{Duration, Instant};

/// 단조 시간 소스 + 블로킹 sleep
pub trait Clock {
    /// 현재 단조 시각
    fn now(&self) -> Instant;

    /// 현재 스레드를 `duration` 동안 대기시킵니다.
    fn sleep(&self, duration: Duration);
}

/// 실제 시스템 시간을 사용하는 [`Clock`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}
