use crate::pac::{is_pac_url, ProxyChoice, ProxyDirective, ProxyScheme, ProxyServer};
use crate::{log_info, log_warn};
use std::env;

/// Proxy settings from the environment, if any apply to `url`.
/// - Honors `<scheme>_proxy` and `no_proxy`, lowercase first, then uppercase.
/// - `HTTP_PROXY` is never read: CGI servers set it from the `Proxy:` request header.
pub fn get_env_proxy(url: &str) -> Option<ProxyDirective> {
    env_proxy_with(url, |name| env::var(name).ok())
}

/// Same as [`get_env_proxy`], reading variables through `lookup`.
pub fn env_proxy_with<F>(url: &str, lookup: F) -> Option<ProxyDirective>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = url::Url::parse(url).ok()?;
    let scheme = parsed.scheme().to_ascii_lowercase();
    let host = parsed.host_str().map(strip_brackets).unwrap_or_default();

    if let Some(no_proxy) = lookup_var(&lookup, "no_proxy", true) {
        if !host.is_empty() && is_host_in_no_proxy(host, &no_proxy) {
            log_info!("Host {} is in NO_PROXY list", host);
            return Some(ProxyDirective::direct());
        }
    }

    let var = format!("{scheme}_proxy");
    let proxy = lookup_var(&lookup, &var, scheme != "http")?;
    let proxy = proxy.trim();
    if proxy.is_empty() {
        return None;
    }
    if is_pac_url(proxy) {
        log_warn!("{} points at a PAC script, not a proxy; ignoring it", var);
        return None;
    }

    match proxy_choice_from_setting(proxy) {
        Some(choice) => {
            log_info!("Proxy {} found in {}", choice, var);
            ProxyDirective::new(vec![choice])
        }
        None => {
            log_warn!("Ignoring unusable proxy setting {}={}", var, proxy);
            None
        }
    }
}

/// Reads `name` as given, then (optionally) its uppercase form.
pub(crate) fn lookup_var<F>(lookup: &F, name: &str, check_uppercase: bool) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).or_else(|| {
        if check_uppercase {
            lookup(&name.to_uppercase())
        } else {
            None
        }
    })
}

/// Turns `http://proxy:3128`, `socks5://10.0.0.1:1080` or a bare `proxy:3128` into a choice.
pub fn proxy_choice_from_setting(setting: &str) -> Option<ProxyChoice> {
    let with_scheme = if setting.contains("://") {
        setting.to_string()
    } else {
        format!("http://{setting}")
    };
    let parsed = url::Url::parse(&with_scheme).ok()?;
    let scheme = match parsed.scheme() {
        "http" => ProxyScheme::Http,
        "https" => ProxyScheme::Https,
        "socks4" | "socks4a" => ProxyScheme::Socks4,
        "socks" | "socks5" | "socks5h" => ProxyScheme::Socks5,
        _ => return None,
    };
    let port = parsed.port_or_known_default().or(match scheme {
        ProxyScheme::Socks4 | ProxyScheme::Socks5 => Some(1080),
        _ => None,
    })?;
    let host = strip_brackets(parsed.host_str()?);
    ProxyServer::new(scheme, host, port).map(ProxyChoice::Proxy)
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// `no_proxy` matching: `*` matches everything, `.corp` and `corp` both match
/// `corp` and its subdomains. Ports in entries are ignored.
fn is_host_in_no_proxy(host: &str, no_proxy: &str) -> bool {
    let host = host.to_ascii_lowercase();
    for entry in no_proxy.split(',') {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            continue;
        }
        if entry == "*" {
            return true;
        }
        let entry = match entry.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) && !name.contains(':') => {
                name.to_string()
            }
            _ => entry,
        };
        let entry = entry.trim_start_matches('.');
        if host == entry || host.ends_with(&format!(".{entry}")) {
            return true;
        }
    }
    false
}
