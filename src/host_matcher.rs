use crate::error::{Error, Result};
use log::debug;
use std::collections::HashMap;

/// 主机名匹配器，把主机名映射到一个策略值（站点别名、直连标记、白名单等）
///
/// 支持四类规则，按从便宜到昂贵的顺序匹配，先命中者生效：
/// 1. `*`：匹配所有主机，存在时直接返回
/// 2. 精确匹配（不含 `*` 的规则）
/// 3. 后缀匹配（以 `*` 开头且其余部分不含 `*`，例如 `*.example.com`），按注册顺序
/// 4. 通配符匹配（其余含 `*`/`?`/`[...]` 的规则），按注册顺序
///
/// 匹配大小写不敏感。规则中不允许出现 `/`。
#[derive(Debug, Clone)]
pub struct HostMatcher<V> {
    star: Option<V>,
    exact: HashMap<String, V>,
    /// (后缀, 值)，保持注册顺序
    suffixes: Vec<(String, V)>,
    /// (模式, 值)，保持注册顺序
    globs: Vec<(String, V)>,
}

impl<V> Default for HostMatcher<V> {
    fn default() -> Self {
        Self {
            star: None,
            exact: HashMap::new(),
            suffixes: Vec::new(),
            globs: Vec::new(),
        }
    }
}

impl HostMatcher<()> {
    /// 只关心是否命中的匹配器
    pub fn from_hosts<I, S>(hosts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(hosts.into_iter().map(|h| (h, ())))
    }
}

impl<V> HostMatcher<V> {
    /// 从 (规则, 值) 列表构造匹配器
    ///
    /// 非法规则（含 `/` 或通配符语法错误）返回 `InvalidHostRule`，属于启动期致命错误。
    pub fn new<I, S>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, V)>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for (rule, value) in rules {
            matcher.add(rule.as_ref(), value)?;
        }
        Ok(matcher)
    }

    /// 追加一条规则
    pub fn add(&mut self, rule: &str, value: V) -> Result<()> {
        let rule = rule.trim().to_lowercase();
        if rule.is_empty() || rule.contains('/') {
            return Err(Error::InvalidHostRule(rule));
        }

        if rule == "*" {
            self.star = Some(value);
        } else if !is_pattern(&rule) {
            self.exact.insert(rule, value);
        } else if let Some(suffix) = rule.strip_prefix('*').filter(|s| !is_pattern(s)) {
            // 同一后缀重复注册时保留第一个
            if !self.suffixes.iter().any(|(s, _)| s == suffix) {
                self.suffixes.push((suffix.to_string(), value));
            }
        } else {
            // 提前校验模式语法，运行期不再出错
            glob_match(&rule, "")?;
            self.globs.push((rule, value));
        }
        Ok(())
    }

    /// 查找主机名对应的值
    pub fn lookup(&self, host: &str) -> Option<&V> {
        if let Some(value) = &self.star {
            return Some(value);
        }

        let host = host.trim_end_matches('.').to_lowercase();

        if let Some(value) = self.exact.get(&host) {
            return Some(value);
        }

        if let Some((_, value)) = self.suffixes.iter().find(|(s, _)| host.ends_with(s.as_str())) {
            return Some(value);
        }

        for (pattern, value) in &self.globs {
            if glob_match(pattern, &host).unwrap_or(false) {
                return Some(value);
            }
        }

        None
    }

    /// 主机名是否命中任一规则
    #[inline]
    pub fn matches(&self, host: &str) -> bool {
        self.lookup(host).is_some()
    }

    /// 规则总数
    pub fn len(&self) -> usize {
        self.star.is_some() as usize + self.exact.len() + self.suffixes.len() + self.globs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 打印规则统计
    pub fn log_summary(&self, name: &str) {
        debug!(
            "主机匹配器 {}: 全匹配={} 精确={} 后缀={} 通配={}",
            name,
            self.star.is_some(),
            self.exact.len(),
            self.suffixes.len(),
            self.globs.len()
        );
    }
}

#[inline]
fn is_pattern(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// shell 风格通配符匹配：`*` 任意序列，`?` 单个字符，`[a-z]`/`[^a-z]` 字符集
///
/// 模式语法错误时返回 `InvalidHostRule`。
fn glob_match(pattern: &str, name: &str) -> Result<bool> {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0usize, 0usize);
    // 最近一个 `*` 的位置以及它当时对应的 name 位置，用于回溯
    let mut star: Option<(usize, usize)> = None;
    let mut matched = None;

    loop {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ni));
                    pi += 1;
                    continue;
                }
                '?' if ni < n.len() => {
                    pi += 1;
                    ni += 1;
                    continue;
                }
                '[' => {
                    let (hit, next) = match_class(&p, pi, n.get(ni).copied())
                        .ok_or_else(|| Error::InvalidHostRule(pattern.to_string()))?;
                    if hit {
                        pi = next;
                        ni += 1;
                        continue;
                    }
                }
                c if ni < n.len() && c != '?' && c == n[ni] => {
                    pi += 1;
                    ni += 1;
                    continue;
                }
                _ => {}
            }
        } else if ni == n.len() {
            matched.get_or_insert(true);
        }

        if matched.is_some() {
            break;
        }

        match star {
            Some((sp, sn)) if sn < n.len() => {
                star = Some((sp, sn + 1));
                pi = sp + 1;
                ni = sn + 1;
            }
            _ => {
                // 仍需扫描剩余模式以发现语法错误
                validate_tail(&p[pi.min(p.len())..])
                    .ok_or_else(|| Error::InvalidHostRule(pattern.to_string()))?;
                matched = Some(false);
                break;
            }
        }
    }

    Ok(matched.unwrap_or(false))
}

/// 匹配一个字符集，返回 (是否命中, 字符集之后的位置)；语法错误返回 None
fn match_class(p: &[char], start: usize, c: Option<char>) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = matches!(p.get(i), Some('^') | Some('!'));
    if negate {
        i += 1;
    }

    let mut hit = false;
    let mut first = true;
    loop {
        let lo = *p.get(i)?;
        if lo == ']' && !first {
            i += 1;
            break;
        }
        first = false;
        i += 1;
        let mut hi = lo;
        if p.get(i) == Some(&'-') && p.get(i + 1).is_some_and(|&x| x != ']') {
            hi = p[i + 1];
            i += 2;
        }
        if let Some(c) = c {
            if lo <= c && c <= hi {
                hit = true;
            }
        }
    }

    Some((c.is_some() && hit != negate, i))
}

fn validate_tail(p: &[char]) -> Option<()> {
    let mut i = 0;
    while i < p.len() {
        if p[i] == '[' {
            let (_, next) = match_class(p, i, None)?;
            i = next;
        } else {
            i += 1;
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(rules: &[(&str, &str)]) -> HostMatcher<String> {
        HostMatcher::new(rules.iter().map(|(r, v)| (*r, v.to_string()))).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let m = HostMatcher::from_hosts(["example.com", "github.com"]).unwrap();

        assert!(m.matches("example.com"));
        assert!(m.matches("EXAMPLE.COM")); // 大小写不敏感
        assert!(m.matches("github.com."));
        assert!(!m.matches("www.example.com"));
        assert!(!m.matches("notexample.com"));
    }

    #[test]
    fn test_suffix_match() {
        let m = matcher(&[("*.example.com", "ex"), ("*.api.example.com", "api")]);

        assert_eq!(m.lookup("www.example.com").map(String::as_str), Some("ex"));
        // 先注册者生效
        assert_eq!(m.lookup("v1.api.example.com").map(String::as_str), Some("ex"));
        assert!(!m.matches("example.com")); // 通配符不匹配主域名本身
        assert!(!m.matches("notexample.com"));
    }

    #[test]
    fn test_star_is_absolute() {
        let m = matcher(&[("*", "any"), ("a.com", "exact"), ("*.b.com", "suffix")]);

        // `*` 存在时优先于所有更具体的规则
        assert_eq!(m.lookup("a.com").map(String::as_str), Some("any"));
        assert_eq!(m.lookup("x.b.com").map(String::as_str), Some("any"));
        assert_eq!(m.lookup("nothing.org").map(String::as_str), Some("any"));
    }

    #[test]
    fn test_precedence_without_star() {
        let m = matcher(&[
            ("www.b.com", "exact"),
            ("*.b.com", "suffix"),
            ("w?w.*.com", "glob"),
        ]);

        assert_eq!(m.lookup("www.b.com").map(String::as_str), Some("exact"));
        assert_eq!(m.lookup("api.b.com").map(String::as_str), Some("suffix"));
        assert_eq!(m.lookup("wxw.c.com").map(String::as_str), Some("glob"));
        assert_eq!(m.lookup("api.c.com"), None);
    }

    #[test]
    fn test_glob_patterns() {
        let m = matcher(&[("mail.google.*", "g"), ("cdn[0-9].site.net", "cdn"), ("[^a]?.org", "neg")]);

        assert!(m.matches("mail.google.com"));
        assert!(m.matches("mail.google.co.jp"));
        assert!(m.matches("cdn7.site.net"));
        assert!(!m.matches("cdnx.site.net"));
        assert!(m.matches("bb.org"));
        assert!(!m.matches("ab.org"));
    }

    #[test]
    fn test_invalid_rules() {
        assert!(matches!(
            HostMatcher::from_hosts(["example.com/path"]),
            Err(Error::InvalidHostRule(_))
        ));
        assert!(matches!(
            HostMatcher::from_hosts(["cdn[0-9.site.net"]),
            Err(Error::InvalidHostRule(_))
        ));
        assert!(HostMatcher::from_hosts([""]).is_err());
    }

    #[test]
    fn test_glob_match_basics() {
        assert!(glob_match("*", "anything").unwrap());
        assert!(glob_match("a*c", "abbbc").unwrap());
        assert!(glob_match("a*c", "ac").unwrap());
        assert!(!glob_match("a*c", "abd").unwrap());
        assert!(glob_match("?", "x").unwrap());
        assert!(!glob_match("?", "").unwrap());
        assert!(glob_match("[]a]", "]").unwrap());
    }
}
