use once_cell::sync::Lazy;
use std::{net::IpAddr, num::NonZeroU32, time::Duration};

use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};

use crate::{error::Error, CONFIG};

type Limiter<T = IpAddr> = RateLimiter<T, DashMapStateStore<T>, DefaultClock>;

static LIMITER_TOKEN: Lazy<Limiter> = Lazy::new(|| {
    let seconds = Duration::from_secs(CONFIG.token_ratelimit_seconds());
    let burst = NonZeroU32::new(CONFIG.token_ratelimit_max_burst()).expect("Non-zero token ratelimit burst");
    RateLimiter::keyed(Quota::with_period(seconds).expect("Non-zero token ratelimit seconds").allow_burst(burst))
});

/// Keyed limiter in front of the token endpoint; polling clients are expected
/// to honour the `interval` hint, this is the backstop for the ones that
/// don't.
pub fn check_limit_token(ip: &IpAddr) -> Result<(), Error> {
    match LIMITER_TOKEN.check_key(ip) {
        Ok(_) => Ok(()),
        Err(_e) => {
            err_code!("Too many token requests", 429);
        }
    }
}
