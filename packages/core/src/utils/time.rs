/// Current UNIX timestamp, seconds
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `true` when `since` lies more than `max_age_seconds` before `now`
pub fn is_older_than(since: i64, now: i64, max_age_seconds: i64) -> bool {
    now.saturating_sub(since) > max_age_seconds
}
