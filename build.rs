use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

/// 100-ns ticks between 0001-01-01T00:00:00Z and the Unix epoch.
const UNIX_EPOCH_TICKS: u64 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: u64 = 10_000_000;

fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=migrations");

    let ticks = build_ticks().expect("failed to compute build epoch");
    println!("cargo:rustc-env=TRACKER_BUILD_TICKS={ticks}");
}

fn build_ticks() -> Result<u64, String> {
    if let Ok(value) = env::var("SOURCE_DATE_EPOCH") {
        let seconds: u64 = value
            .trim()
            .parse()
            .map_err(|err| format!("invalid SOURCE_DATE_EPOCH `{value}`: {err}"))?;
        return Ok(UNIX_EPOCH_TICKS + seconds * TICKS_PER_SECOND);
    }

    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| format!("system clock before unix epoch: {err}"))?;

    Ok(UNIX_EPOCH_TICKS
        + elapsed.as_secs() * TICKS_PER_SECOND
        + u64::from(elapsed.subsec_nanos()) / 100)
}
