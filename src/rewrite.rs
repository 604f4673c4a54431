//! Path rewrite policy: one POSIX extended regex, one literal replacement,
//! first match only.

use std::ffi::CString;
use std::mem::MaybeUninit;

use anyhow::{Context, Result};
use libc::{regex_t, regmatch_t};
use log::{debug, error, info};
use thiserror::Error;

use crate::types::RewriteRule;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum PatternError {
    #[error("pattern contains a NUL byte")]
    Nul,
    #[error("{0}")]
    Syntax(String),
}

/// A pattern compiled by the C library's `regcomp` with `REG_EXTENDED`.
///
/// Matches leftmost-longest and byte-wise, as `grep -E` does in the C locale.
struct PosixRegex {
    raw: Box<regex_t>,
}

impl PosixRegex {
    fn new(pattern: &str) -> Result<Self, PatternError> {
        let pattern = CString::new(pattern).map_err(|_| PatternError::Nul)?;
        let mut raw: Box<MaybeUninit<regex_t>> = Box::new(MaybeUninit::zeroed());
        // SAFETY: `raw` is writable storage for one regex_t and `pattern` is NUL-terminated.
        let rc = unsafe { libc::regcomp(raw.as_mut_ptr(), pattern.as_ptr(), libc::REG_EXTENDED) };
        if rc != 0 {
            return Err(PatternError::Syntax(describe(rc, raw.as_ptr())));
        }
        // SAFETY: regcomp succeeded, so the regex_t is initialised.
        Ok(PosixRegex {
            raw: unsafe { raw.assume_init() },
        })
    }

    /// Byte span of the leftmost-longest match in `haystack`.
    fn find(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        let haystack = CString::new(haystack).ok()?;
        let mut found = [regmatch_t { rm_so: -1, rm_eo: -1 }];
        // SAFETY: the compiled pattern is live and `found` has room for one match.
        let rc = unsafe {
            libc::regexec(&*self.raw, haystack.as_ptr(), found.len(), found.as_mut_ptr(), 0)
        };
        if rc != 0 || found[0].rm_so < 0 {
            return None;
        }
        Some((found[0].rm_so as usize, found[0].rm_eo as usize))
    }
}

impl Drop for PosixRegex {
    fn drop(&mut self) {
        // SAFETY: `raw` was filled by a successful regcomp and is freed once.
        unsafe { libc::regfree(&mut *self.raw) };
    }
}

fn describe(code: libc::c_int, raw: *const regex_t) -> String {
    let mut buf = [0u8; 256];
    // SAFETY: regerror writes at most `buf.len()` bytes, NUL included.
    unsafe { libc::regerror(code, raw, buf.as_mut_ptr().cast(), buf.len()) };
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// A compiled pattern together with the source it was built from.
struct CompiledPattern {
    source: String,
    regex: PosixRegex,
}

/// Compiled form of `pattern`, recompiling only when it differs from the
/// cached source.
fn compile<'a>(
    cache: &'a mut Option<CompiledPattern>,
    pattern: &str,
) -> Result<&'a PosixRegex, PatternError> {
    let compiled = match cache.take() {
        Some(cached) if cached.source == pattern => cached,
        _ => {
            info!("Compiling new path interceptor regex: {}", pattern);
            CompiledPattern {
                source: pattern.to_string(),
                regex: PosixRegex::new(pattern)?,
            }
        }
    };
    Ok(&cache.insert(compiled).regex)
}

/// Applies the configured [`RewriteRule`] to intercepted paths.
///
/// Without a rule every path passes through unchanged.
pub(crate) struct RewritePolicy {
    rule: Option<RewriteRule>,
    compiled: Option<CompiledPattern>,
}

impl RewritePolicy {
    /// Build the policy, compiling the pattern up front so a bad pattern
    /// is reported before the target starts.
    pub(crate) fn new(rule: Option<RewriteRule>) -> Result<Self> {
        let mut compiled = None;
        if let Some(rule) = &rule {
            compile(&mut compiled, &rule.pattern)
                .with_context(|| format!("Invalid path match pattern {:?}", rule.pattern))?;
        }
        Ok(RewritePolicy { rule, compiled })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.rule.is_some()
    }

    /// Return `path` with the first match of the pattern replaced, or
    /// `None` when there is no rule or no match.
    pub(crate) fn rewrite(&mut self, path: &[u8]) -> Option<Vec<u8>> {
        let Some(rule) = &self.rule else {
            debug!(
                "No path replacer defined. Passing path through: {}",
                String::from_utf8_lossy(path)
            );
            return None;
        };

        debug!("Path interception requested: {}", String::from_utf8_lossy(path));
        let regex = match compile(&mut self.compiled, &rule.pattern) {
            Ok(regex) => regex,
            Err(e) => {
                error!("Cannot compile path match pattern {:?}: {}", rule.pattern, e);
                return None;
            }
        };

        match replace_first(regex, path, rule.replacement.as_bytes()) {
            Some(replaced) => {
                debug!("Intercepted path: {}", String::from_utf8_lossy(path));
                Some(replaced)
            }
            None => {
                debug!("Not intercepting path: {}", String::from_utf8_lossy(path));
                None
            }
        }
    }
}

/// Splice `replacement` over the first match of `regex` in `haystack`.
fn replace_first(regex: &PosixRegex, haystack: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
    let (start, end) = regex.find(haystack)?;
    let mut out = Vec::with_capacity(haystack.len() - (end - start) + replacement.len());
    out.extend_from_slice(&haystack[..start]);
    out.extend_from_slice(replacement);
    out.extend_from_slice(&haystack[end..]);
    Some(out)
}
