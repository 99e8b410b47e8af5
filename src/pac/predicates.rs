// src/pac/predicates.rs
//! The classic PAC helper functions, as plain Rust.
//!
//! None of these fail: anything that cannot be evaluated is `false`.

use std::net::Ipv4Addr;

use chrono::{Datelike, NaiveDate, Timelike};
use regex::Regex;

use super::capabilities::{HostResolver, Moment};

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const MAX_YEAR: i64 = 9999;
const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

pub fn is_plain_host_name(host: &str) -> bool {
    !host.contains('.')
}

pub fn dns_domain_is(host: &str, domain: &str) -> bool {
    host.ends_with(domain)
}

pub fn local_host_or_domain_is(host: &str, hostdom: &str) -> bool {
    host == hostdom
        || hostdom
            .strip_prefix(host)
            .is_some_and(|rest| rest.starts_with('.'))
}

pub fn dns_domain_levels(host: &str) -> usize {
    host.matches('.').count()
}

pub fn is_resolvable(host: &str, resolver: &dyn HostResolver) -> bool {
    resolver.resolve(host).is_some()
}

pub fn dns_resolve(host: &str, resolver: &dyn HostResolver) -> Option<String> {
    resolver.resolve(host).map(|ip| ip.to_string())
}

pub fn my_ip_address(resolver: &dyn HostResolver) -> String {
    resolver
        .local_address()
        .unwrap_or(Ipv4Addr::LOCALHOST)
        .to_string()
}

pub fn convert_addr(ip: &str) -> Option<u32> {
    ip.trim().parse::<Ipv4Addr>().ok().map(u32::from)
}

pub fn is_in_net(host: &str, pattern: &str, mask: &str, resolver: &dyn HostResolver) -> bool {
    let (Ok(pattern), Ok(mask)) = (pattern.parse::<Ipv4Addr>(), mask.parse::<Ipv4Addr>()) else {
        return false;
    };
    let Some(ip) = resolver.resolve(host) else {
        return false;
    };
    let mask = u32::from(mask);
    u32::from(ip) & mask == u32::from(pattern) & mask
}

/// Anchored shell-glob match: `*` is any run of characters, `?` exactly one.
pub fn sh_exp_match(text: &str, pattern: &str) -> bool {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).is_ok_and(|re| re.is_match(text))
}

fn split_gmt(args: &[String]) -> (&[String], bool) {
    match args.split_last() {
        Some((last, rest)) if last.trim().eq_ignore_ascii_case("GMT") => (rest, true),
        _ => (args, false),
    }
}

fn weekday_index(name: &str) -> Option<u32> {
    let name = name.trim();
    WEEKDAYS
        .iter()
        .position(|day| day.eq_ignore_ascii_case(name))
        .map(|i| i as u32)
}

fn month_number(name: &str) -> Option<u32> {
    let name = name.trim();
    MONTHS
        .iter()
        .position(|month| month.eq_ignore_ascii_case(name))
        .map(|i| i as u32 + 1)
}

fn within<T: PartialOrd>(value: T, start: T, end: T) -> bool {
    if start <= end {
        start <= value && value <= end
    } else {
        value >= start || value <= end
    }
}

/// `weekdayRange(wd1[, wd2][, "GMT"])`; a reversed range wraps over the weekend.
pub fn weekday_range(args: &[String], now: &Moment) -> bool {
    let (args, gmt) = split_gmt(args);
    let today = now.pick(gmt).weekday().num_days_from_sunday();
    let bounds = match args {
        [day] => weekday_index(day).map(|d| (d, d)),
        [first, last] => weekday_index(first).zip(weekday_index(last)),
        _ => None,
    };
    bounds.is_some_and(|(first, last)| within(today, first, last))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatePart {
    Day(u32),
    Month(u32),
    Year(i32),
}

fn date_part(token: &str) -> Option<DatePart> {
    let token = token.trim();
    match token.parse::<i64>() {
        Ok(n) if (1..32).contains(&n) => Some(DatePart::Day(n as u32)),
        Ok(n) if (32..=MAX_YEAR).contains(&n) => Some(DatePart::Year(n as i32)),
        Ok(_) => None,
        Err(_) => month_number(token).map(DatePart::Month),
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        year.checked_add(1).map(|y| (y, 1))
    } else {
        Some((year, month + 1))
    };
    next.and_then(|(next_year, next_month)| NaiveDate::from_ymd_opt(next_year, next_month, 1))
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn date_bound(parts: &[DatePart], today: NaiveDate, upper: bool, this_month: bool) -> Option<NaiveDate> {
    let mut day = None;
    let mut month = None;
    let mut year = None;
    for part in parts {
        match *part {
            DatePart::Day(d) => day = Some(d),
            DatePart::Month(m) => month = Some(m),
            DatePart::Year(y) => year = Some(y),
        }
    }
    let year = year.unwrap_or(today.year());
    let month = match month {
        Some(m) => m,
        None if this_month => today.month(),
        None if upper => 12,
        None => 1,
    };
    let last = last_day_of_month(year, month);
    let day = match day {
        Some(d) => d.min(last),
        None if upper => last,
        None => 1,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// `dateRange(...)`: one value compares a single field; 2, 4 or 6 values give lower
/// and upper bounds, each half listing day/month/year in any order.
pub fn date_range(args: &[String], now: &Moment) -> bool {
    let (args, gmt) = split_gmt(args);
    let today = now.pick(gmt).date();
    let Some(parts) = args.iter().map(|a| date_part(a)).collect::<Option<Vec<_>>>() else {
        return false;
    };

    match parts.as_slice() {
        [] => false,
        [DatePart::Day(d)] => today.day() == *d,
        [DatePart::Month(m)] => today.month() == *m,
        [DatePart::Year(y)] => today.year() == *y,
        parts if parts.len() % 2 == 0 && parts.len() <= 6 => {
            let (lower, upper) = parts.split_at(parts.len() / 2);
            let days_only = parts.len() == 2 && matches!(lower, [DatePart::Day(_)]);
            let start = date_bound(lower, today, false, days_only);
            let end = date_bound(upper, today, true, days_only);
            match (start, end) {
                (Some(start), Some(end)) => within(today, start, end),
                _ => false,
            }
        }
        _ => false,
    }
}

/// `timeRange(...)`: hour, hour range, `h:m` range or `h:m:s` range.
///
/// Ranges never wrap past midnight: a start later than the end matches nothing.
pub fn time_range(args: &[String], now: &Moment) -> bool {
    let (args, gmt) = split_gmt(args);
    let now = now.pick(gmt);
    let Some(values) = args
        .iter()
        .map(|a| a.trim().parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()
    else {
        return false;
    };
    let current = seconds_of_day(now.hour(), now.minute(), now.second());

    let (start, end) = match values.as_slice() {
        [hour] => return now.hour() == *hour,
        [first, last] => return *first <= now.hour() && now.hour() <= *last,
        [h1, m1, h2, m2] => (seconds_of_day(*h1, *m1, 0), seconds_of_day(*h2, *m2, 59)),
        [h1, m1, s1, h2, m2, s2] => (seconds_of_day(*h1, *m1, *s1), seconds_of_day(*h2, *m2, *s2)),
        _ => return false,
    };
    match (current, start, end) {
        (Some(current), Some(start), Some(end)) => start <= current && current <= end,
        _ => false,
    }
}

fn seconds_of_day(hour: u32, minute: u32, second: u32) -> Option<u32> {
    (hour < 24 && minute < 60 && second < 60).then(|| hour * 3600 + minute * 60 + second)
}
