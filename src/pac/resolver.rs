use std::sync::Mutex;

use serde::Deserialize;

use crate::address::{Address, NetLocation};
use crate::error::{ParseError, ResolutionError};
use crate::pac::sandbox::ScriptSandbox;
use crate::pac::source::ScriptSource;

/// One candidate from a PAC evaluation, in the order the script listed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDescriptor {
    Direct,
    Http(NetLocation),
    Socks4(NetLocation),
    Socks5(NetLocation),
}

impl std::fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyDescriptor::Direct => write!(f, "DIRECT"),
            ProxyDescriptor::Http(location) => write!(f, "PROXY {location}"),
            ProxyDescriptor::Socks4(location) => write!(f, "SOCKS4 {location}"),
            ProxyDescriptor::Socks5(location) => write!(f, "SOCKS5 {location}"),
        }
    }
}

/// What to do when a resolve targets the host serving the PAC script itself.
/// Evaluating in that situation can recurse through the gateway forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopGuardPolicy {
    #[default]
    NoProxy,
    Direct,
    Fail,
}

/// Evaluates the configured PAC source for a target URL and parses the
/// script's answer into an ordered candidate list.
pub struct ProxyResolver {
    source: Mutex<ScriptSource>,
    sandbox: ScriptSandbox,
    loop_guard: LoopGuardPolicy,
}

impl ProxyResolver {
    pub fn new(source: ScriptSource, sandbox: ScriptSandbox, loop_guard: LoopGuardPolicy) -> Self {
        Self {
            source: Mutex::new(source),
            sandbox,
            loop_guard,
        }
    }

    /// Blocking: may fetch the script over HTTP and the script may perform
    /// DNS lookups. Concurrent resolves serialize on the cached source.
    pub fn resolve(
        &self,
        url: &str,
        host: &str,
    ) -> Result<Vec<ProxyDescriptor>, ResolutionError> {
        let script = {
            let mut source = self.source.lock().unwrap_or_else(|e| e.into_inner());
            if !host.is_empty() && source.description().contains(host) {
                log::warn!(
                    "resolve for {host} targets the PAC source itself, applying {:?}",
                    self.loop_guard
                );
                return match self.loop_guard {
                    LoopGuardPolicy::NoProxy => Ok(Vec::new()),
                    LoopGuardPolicy::Direct => Ok(vec![ProxyDescriptor::Direct]),
                    LoopGuardPolicy::Fail => {
                        Err(ResolutionError::LoopDetected(host.to_string()))
                    }
                };
            }
            source.content()?
        };

        let result = self.sandbox.evaluate(&script, url, host)?;
        log::debug!("PAC result for {host}: {result}");
        Ok(parse_proxy_spec(&result)?)
    }
}

/// Parses a `FindProxyForURL` result string, e.g.
/// `"PROXY cache.example.com:8080; SOCKS 10.0.0.1:1080; DIRECT"`.
pub fn parse_proxy_spec(spec: &str) -> Result<Vec<ProxyDescriptor>, ParseError> {
    let mut descriptors = Vec::new();
    for segment in spec.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        descriptors.push(parse_segment(segment)?);
    }
    Ok(descriptors)
}

fn parse_segment(segment: &str) -> Result<ProxyDescriptor, ParseError> {
    // Anything too short to carry "<type> <host>" degrades to DIRECT rather
    // than failing the whole candidate list.
    if segment.len() < 6 {
        return Ok(ProxyDescriptor::Direct);
    }
    let upper = segment.to_uppercase();
    if upper.starts_with("DIRECT") {
        return Ok(ProxyDescriptor::Direct);
    }
    let socks = upper.starts_with("SOCKS");

    // The split index is in bytes; a multi-byte character straddling it
    // means the segment cannot be a well-formed "<type> <host>" pair.
    let rest = segment.get(6..).ok_or_else(|| {
        ParseError::InvalidHost(
            segment.to_string(),
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "proxy type is not followed by a host",
            ),
        )
    })?;
    let (host, port) = match rest.find(':') {
        Some(pos) => {
            let port = rest[pos + 1..]
                .trim()
                .parse::<u16>()
                .map_err(|_| ParseError::InvalidPort(segment.to_string()))?;
            (rest[..pos].trim(), port)
        }
        None => (rest.trim(), 80),
    };

    if host.is_empty() {
        return Err(ParseError::EmptyHost(segment.to_string()));
    }
    if port == 0 {
        return Err(ParseError::InvalidPort(segment.to_string()));
    }
    let address = Address::from(host)
        .map_err(|e| ParseError::InvalidHost(segment.to_string(), e))?;
    let location = NetLocation::new(address, port);

    if socks {
        Ok(ProxyDescriptor::Socks5(location))
    } else {
        Ok(ProxyDescriptor::Http(location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pac::builtins::PacBuiltins;

    fn http(host: &str, port: u16) -> ProxyDescriptor {
        ProxyDescriptor::Http(NetLocation::new(Address::from(host).unwrap(), port))
    }

    fn socks5(host: &str, port: u16) -> ProxyDescriptor {
        ProxyDescriptor::Socks5(NetLocation::new(Address::from(host).unwrap(), port))
    }

    #[test]
    fn test_parse_single_segments() {
        assert_eq!(
            parse_proxy_spec("PROXY cache.example.com:8080").unwrap(),
            vec![http("cache.example.com", 8080)]
        );
        assert_eq!(
            parse_proxy_spec("SOCKS 10.0.0.1:1080").unwrap(),
            vec![socks5("10.0.0.1", 1080)]
        );
        assert_eq!(parse_proxy_spec("DIRECT").unwrap(), vec![ProxyDescriptor::Direct]);
        // Default port when the script leaves it off.
        assert_eq!(
            parse_proxy_spec("PROXY cache.example.com").unwrap(),
            vec![http("cache.example.com", 80)]
        );
    }

    #[test]
    fn test_parse_ordered_list() {
        let parsed =
            parse_proxy_spec("PROXY a.example.com:3128; SOCKS b.example.com:1080; DIRECT")
                .unwrap();
        assert_eq!(
            parsed,
            vec![
                http("a.example.com", 3128),
                socks5("b.example.com", 1080),
                ProxyDescriptor::Direct,
            ]
        );
    }

    #[test]
    fn test_parse_drops_empty_and_degrades_short_segments() {
        assert_eq!(parse_proxy_spec("").unwrap(), Vec::new());
        assert_eq!(parse_proxy_spec(" ; ; ").unwrap(), Vec::new());
        assert_eq!(parse_proxy_spec("PROXY").unwrap(), vec![ProxyDescriptor::Direct]);
        assert_eq!(
            parse_proxy_spec("direct; proxy p.example.com:1").unwrap(),
            vec![ProxyDescriptor::Direct, http("p.example.com", 1)]
        );
    }

    #[test]
    fn test_parse_rejects_bad_hosts_and_ports() {
        assert!(matches!(
            parse_proxy_spec("PROXY :8080"),
            Err(ParseError::EmptyHost(_))
        ));
        assert!(matches!(
            parse_proxy_spec("PROXY h.example.com:0"),
            Err(ParseError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_proxy_spec("PROXY h.example.com:notaport"),
            Err(ParseError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_proxy_spec("PROXY h.example.com:99999"),
            Err(ParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_parse_multibyte_char_at_type_boundary() {
        // "SOCKS\u{e9}..." puts a two-byte character across the type/host
        // split; this must come back as an error, not a panic.
        assert!(matches!(
            parse_proxy_spec("SOCKS\u{e9}x:80"),
            Err(ParseError::InvalidHost(_, _))
        ));
        // Multi-byte characters after the split must not panic either.
        let _ = parse_proxy_spec("PROXY caf\u{e9}.example.com:8080");
    }

    fn file_resolver(script: &str, loop_guard: LoopGuardPolicy) -> (ProxyResolver, std::path::PathBuf) {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "pacbridge-resolver-{}-{}.pac",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, script).unwrap();
        let source = ScriptSource::new(path.to_str().unwrap()).unwrap();
        let sandbox = ScriptSandbox::new(PacBuiltins::new(None));
        (ProxyResolver::new(source, sandbox, loop_guard), path)
    }

    #[test]
    fn test_resolve_end_to_end() {
        let script = r#"
            function FindProxyForURL(url, host) {
                if (shExpMatch(host, "*.internal.example.com")) return "DIRECT";
                return "PROXY gw.example.com:8080; DIRECT";
            }
        "#;
        let (resolver, path) = file_resolver(script, LoopGuardPolicy::NoProxy);
        assert_eq!(
            resolver
                .resolve("http://db.internal.example.com/", "db.internal.example.com")
                .unwrap(),
            vec![ProxyDescriptor::Direct]
        );
        assert_eq!(
            resolver
                .resolve("http://www.example.org/", "www.example.org")
                .unwrap(),
            vec![http("gw.example.com", 8080), ProxyDescriptor::Direct]
        );
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_loop_guard_policies() {
        // The source locator is a temp file path; use a host that appears in
        // it to trigger the guard.
        let script = "function FindProxyForURL(u, h) { return 'PROXY x.example.com:1'; }";

        let (resolver, path) = file_resolver(script, LoopGuardPolicy::NoProxy);
        let needle = "pacbridge-resolver";
        assert_eq!(resolver.resolve("http://x/", needle).unwrap(), Vec::new());
        std::fs::remove_file(path).unwrap();

        let (resolver, path) = file_resolver(script, LoopGuardPolicy::Direct);
        assert_eq!(
            resolver.resolve("http://x/", needle).unwrap(),
            vec![ProxyDescriptor::Direct]
        );
        std::fs::remove_file(path).unwrap();

        let (resolver, path) = file_resolver(script, LoopGuardPolicy::Fail);
        assert!(matches!(
            resolver.resolve("http://x/", needle),
            Err(ResolutionError::LoopDetected(_))
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_loop_guard_policy_deserializes_kebab_case() {
        assert_eq!(
            serde_yaml::from_str::<LoopGuardPolicy>("no-proxy").unwrap(),
            LoopGuardPolicy::NoProxy
        );
        assert_eq!(
            serde_yaml::from_str::<LoopGuardPolicy>("fail").unwrap(),
            LoopGuardPolicy::Fail
        );
    }
}
