use std::net::{IpAddr, ToSocketAddrs, UdpSocket};

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::EvalError;
use crate::pac::interp::{HostFunctions, Value};

const DAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// The host-function library a PAC script runs against. DNS lookups are
/// blocking, so evaluation belongs on a blocking-friendly thread.
pub struct PacBuiltins {
    my_ip_override: Option<String>,
    fixed_now: Option<NaiveDateTime>,
}

impl PacBuiltins {
    pub fn new(my_ip_override: Option<String>) -> Self {
        Self {
            my_ip_override,
            fixed_now: None,
        }
    }

    /// Pins the clock the time-based builtins see. Test hook.
    pub fn with_fixed_now(my_ip_override: Option<String>, now: NaiveDateTime) -> Self {
        Self {
            my_ip_override,
            fixed_now: Some(now),
        }
    }

    fn current_time(&self, use_gmt: bool) -> NaiveDateTime {
        if let Some(now) = self.fixed_now {
            return now;
        }
        if use_gmt {
            chrono::Utc::now().naive_utc()
        } else {
            chrono::Local::now().naive_local()
        }
    }

    fn is_plain_host_name(&self, host: &str) -> bool {
        !host.contains('.')
    }

    fn dns_domain_is(&self, host: &str, domain: &str) -> bool {
        host.ends_with(domain)
    }

    // Asymmetric on purpose: a bare "www" matches "www.example.com".
    fn local_host_or_domain_is(&self, host: &str, domain: &str) -> bool {
        domain.starts_with(host)
    }

    fn is_resolvable(&self, host: &str) -> bool {
        !resolve_all(host).is_empty()
    }

    fn is_in_net(&self, host: &str, pattern: &str, mask: &str) -> bool {
        let host_ip = match parse_quad(host) {
            Some(ip) => ip,
            None => match self.dns_resolve(host) {
                resolved if !resolved.is_empty() => match parse_quad(&resolved) {
                    Some(ip) => ip,
                    None => return false,
                },
                _ => return false,
            },
        };
        match (parse_quad(pattern), parse_quad(mask)) {
            (Some(pattern), Some(mask)) => (host_ip & mask) == pattern,
            _ => false,
        }
    }

    fn dns_resolve(&self, host: &str) -> String {
        let addrs = resolve_all(host);
        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    fn dns_resolve_ex(&self, host: &str) -> String {
        let addrs: Vec<String> = resolve_all(host).iter().map(|a| a.to_string()).collect();
        addrs.join("; ")
    }

    fn my_ip_address(&self) -> String {
        if let Some(ref override_ip) = self.my_ip_override {
            let trimmed = override_ip.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        local_outbound_address().unwrap_or_default()
    }

    fn my_ip_address_ex(&self) -> String {
        if let Some(ref override_ip) = self.my_ip_override {
            let trimmed = override_ip.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        self.dns_resolve_ex("localhost")
    }

    fn dns_domain_levels(&self, host: &str) -> f64 {
        host.matches('.').count() as f64
    }

    /// Ordered substring search over the `*`-separated fragments. Not
    /// anchored at either end, so "a*b" matches "xaybz".
    fn sh_exp_match(&self, s: &str, shexp: &str) -> bool {
        let mut start_pos = 0usize;
        for fragment in shexp.split('*').filter(|f| !f.is_empty()) {
            match s[start_pos..].find(fragment) {
                Some(pos) => {
                    start_pos += pos + fragment.len();
                }
                None => return false,
            }
        }
        true
    }

    fn weekday_range(&self, args: &[Value]) -> bool {
        let arg_str = |i: usize| -> Option<String> { args.get(i).map(|v| v.coerce_string()) };
        let wd1 = arg_str(0);
        let wd2 = arg_str(1);
        let gmt = arg_str(2);

        let is_gmt = |v: &Option<String>| {
            v.as_deref()
                .map(|s| s.eq_ignore_ascii_case("GMT"))
                .unwrap_or(false)
        };
        let use_gmt = is_gmt(&wd2) || is_gmt(&gmt);

        let day_index = |v: &Option<String>| -> i32 {
            v.as_deref()
                .and_then(|s| {
                    let upper = s.to_uppercase();
                    DAYS.iter().position(|d| *d == upper)
                })
                .map(|i| i as i32)
                .unwrap_or(-1)
        };

        let current = self
            .current_time(use_gmt)
            .weekday()
            .num_days_from_sunday() as i32;
        let from = day_index(&wd1);
        let mut to = day_index(&wd2);
        if to == -1 {
            to = from;
        }

        if to < from {
            current >= from || current <= to
        } else {
            current >= from && current <= to
        }
    }

    fn date_range(&self, args: &[Value]) -> bool {
        let mut params = DateParams::default();
        for arg in args {
            params.note(arg);
        }

        let now = self.current_time(params.gmt);
        let mut cal = Calendar::from(now);

        if let Some(day) = params.day1 {
            cal.day = day;
        }
        if let Some(month) = params.month1 {
            cal.month = month;
        }
        if let Some(year) = params.year1 {
            cal.year = year;
        }
        let from = cal.to_naive();

        if let Some(day) = params.day2 {
            cal.day = day;
        }
        if let Some(month) = params.month2 {
            cal.month = month;
        }
        if let Some(year) = params.year2 {
            cal.year = year;
        }
        let mut to = cal.to_naive();

        // An unqualified "to" below "from" means the range wraps into the
        // next month, or failing that the next year.
        if to < from {
            cal.add_months(1);
            to = cal.to_naive();
        }
        if to < from {
            cal.year += 1;
            cal.add_months(-1);
            to = cal.to_naive();
        }

        now >= from && now <= to
    }

    fn time_range(&self, args: &[Value]) -> Result<bool, EvalError> {
        let use_gmt = args.iter().any(|v| {
            matches!(v, Value::Str(s) if s.eq_ignore_ascii_case("GMT"))
        });
        let nums: Vec<u32> = args
            .iter()
            .filter(|v| matches!(v, Value::Num(_)))
            .map(|v| v.to_number() as u32)
            .collect();

        let bounds = match nums.as_slice() {
            [h] => TimeBounds {
                from: (*h, 0, 0),
                to: (*h, 59, 59),
            },
            [h1, h2] => TimeBounds {
                from: (*h1, 0, 0),
                to: (*h2, 59, 59),
            },
            [h1, m1, h2, m2] => TimeBounds {
                from: (*h1, *m1, 0),
                to: (*h2, *m2, 59),
            },
            [h1, m1, s1, h2, m2, s2] => TimeBounds {
                from: (*h1, *m1, *s1),
                to: (*h2, *m2, *s2),
            },
            other => {
                return Err(EvalError::Runtime(format!(
                    "timeRange: unsupported argument count {}",
                    other.len()
                )));
            }
        };

        let now = self.current_time(use_gmt).with_nanosecond(0).unwrap_or_else(|| self.current_time(use_gmt));
        let today = now.date();
        let make = |(h, m, s): (u32, u32, u32)| -> Result<NaiveDateTime, EvalError> {
            NaiveTime::from_hms_opt(h, m, s)
                .map(|t| today.and_time(t))
                .ok_or_else(|| {
                    EvalError::Runtime(format!("timeRange: invalid time {h}:{m}:{s}"))
                })
        };
        let from = make(bounds.from)?;
        let mut to = make(bounds.to)?;
        if to < from {
            to += chrono::Duration::days(1);
        }
        Ok(now >= from && now <= to)
    }
}

struct TimeBounds {
    from: (u32, u32, u32),
    to: (u32, u32, u32),
}

/// Positional guessing for `dateRange` arguments: numbers up to 31 are days,
/// larger numbers are years, month names are months, "GMT" is the zone flag.
/// First occurrence fills the "from" slot, second fills "to".
#[derive(Default)]
struct DateParams {
    day1: Option<u32>,
    day2: Option<u32>,
    month1: Option<u32>,
    month2: Option<u32>,
    year1: Option<i32>,
    year2: Option<i32>,
    gmt: bool,
}

impl DateParams {
    fn note(&mut self, value: &Value) {
        match value {
            Value::Num(n) => {
                let n = *n as i64;
                if n <= 31 {
                    let day = n.max(0) as u32;
                    if self.day1.is_none() {
                        self.day1 = Some(day);
                    } else {
                        self.day2 = Some(day);
                    }
                } else if self.year1.is_none() {
                    self.year1 = Some(n as i32);
                } else {
                    self.year2 = Some(n as i32);
                }
            }
            Value::Str(s) => {
                let upper = s.to_uppercase();
                if let Some(month) = MONTHS.iter().position(|m| *m == upper) {
                    let month = month as u32 + 1;
                    if self.month1.is_none() {
                        self.month1 = Some(month);
                    } else {
                        self.month2 = Some(month);
                    }
                } else if upper == "GMT" {
                    self.gmt = true;
                }
            }
            _ => {}
        }
    }
}

/// Mutable calendar fields for date-range arithmetic. Days past the end of
/// the target month clamp to its last day.
struct Calendar {
    year: i32,
    month: u32,
    day: u32,
    time: NaiveTime,
}

impl Calendar {
    fn from(now: NaiveDateTime) -> Self {
        Self {
            year: now.year(),
            month: now.month(),
            day: now.day(),
            time: now.time(),
        }
    }

    fn add_months(&mut self, delta: i32) {
        let total = self.year * 12 + self.month as i32 - 1 + delta;
        self.year = total.div_euclid(12);
        self.month = total.rem_euclid(12) as u32 + 1;
    }

    fn to_naive(&self) -> NaiveDateTime {
        let date = NaiveDate::from_ymd_opt(self.year, self.month, self.day)
            .or_else(|| {
                let last = last_day_of_month(self.year, self.month);
                NaiveDate::from_ymd_opt(self.year, self.month, last)
            })
            .unwrap_or_default();
        date.and_time(self.time)
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    for day in [31, 30, 29, 28] {
        if NaiveDate::from_ymd_opt(year, month, day).is_some() {
            return day;
        }
    }
    28
}

fn resolve_all(host: &str) -> Vec<IpAddr> {
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(_) => {
            log::debug!("hostname not resolvable: {host}");
            Vec::new()
        }
    }
}

/// The address of the interface a default-route packet would leave on. The
/// socket is never actually used to send anything.
fn local_outbound_address() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// Parses a dotted quad into its 32-bit value. Fewer than four parts leave
/// the low octets zero, matching how SOCKS-style mask configs are written.
fn parse_quad(address: &str) -> Option<u32> {
    let mut result = 0u32;
    let mut shift = 24i32;
    for part in address.split('.') {
        if shift < 0 {
            return None;
        }
        let octet = part.parse::<u32>().ok()?;
        if octet > 255 {
            return None;
        }
        result |= octet << shift;
        shift -= 8;
    }
    Some(result)
}

impl HostFunctions for PacBuiltins {
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, EvalError>> {
        let arg_str = |i: usize| -> String {
            args.get(i).map(|v| v.coerce_string()).unwrap_or_default()
        };
        let result = match name {
            "isPlainHostName" => Value::Bool(self.is_plain_host_name(&arg_str(0))),
            "dnsDomainIs" => Value::Bool(self.dns_domain_is(&arg_str(0), &arg_str(1))),
            "localHostOrDomainIs" => {
                Value::Bool(self.local_host_or_domain_is(&arg_str(0), &arg_str(1)))
            }
            "isResolvable" | "isResolvableEx" => Value::Bool(self.is_resolvable(&arg_str(0))),
            "isInNet" => Value::Bool(self.is_in_net(&arg_str(0), &arg_str(1), &arg_str(2))),
            "isInNetEx" => Value::Bool(false),
            "dnsResolve" => Value::Str(self.dns_resolve(&arg_str(0))),
            "dnsResolveEx" => Value::Str(self.dns_resolve_ex(&arg_str(0))),
            "myIpAddress" => Value::Str(self.my_ip_address()),
            "myIpAddressEx" => Value::Str(self.my_ip_address_ex()),
            "dnsDomainLevels" => Value::Num(self.dns_domain_levels(&arg_str(0))),
            "shExpMatch" => Value::Bool(self.sh_exp_match(&arg_str(0), &arg_str(1))),
            "weekdayRange" => Value::Bool(self.weekday_range(args)),
            "dateRange" => Value::Bool(self.date_range(args)),
            "timeRange" => match self.time_range(args) {
                Ok(result) => Value::Bool(result),
                Err(e) => return Some(Err(e)),
            },
            "sortIpAddressList" => Value::Str(arg_str(0)),
            "getClientVersion" => Value::Str("1.0".to_string()),
            _ => return None,
        };
        Some(Ok(result))
    }
}
