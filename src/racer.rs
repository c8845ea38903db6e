use crate::error::{Error, Result};
use crate::ttl_cache::TtlCache;
use log::{debug, trace};
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// 地址的历史表现
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    /// 最近一次拨号成功及其耗时
    Good(Duration),
    /// 最近一次拨号失败
    Bad,
    /// 没有记录
    Unknown,
}

/// 单个地址的最近一次拨号结果
#[derive(Debug, Clone)]
enum Record {
    Good(Duration),
    Bad(String),
}

/// 按地址记录最近一次拨号耗时或错误，带过期时间
///
/// 每个地址只保留一条记录，成功与失败互相覆盖。并发写入同一地址时后写者生效。
#[derive(Debug)]
pub struct ScoreCache {
    records: TtlCache<String, Record>,
    good_expiry: Duration,
    error_expiry: Duration,
}

impl ScoreCache {
    pub fn new(capacity: usize, good_expiry: Duration, error_expiry: Duration) -> Self {
        Self {
            records: TtlCache::new(capacity),
            good_expiry,
            error_expiry,
        }
    }

    pub fn record_success(&self, addr: &str, elapsed: Duration) {
        self.records.set(
            addr.to_string(),
            Record::Good(elapsed),
            Some(self.good_expiry),
        );
    }

    pub fn record_failure(&self, addr: &str, err: &Error) {
        self.records.set(
            addr.to_string(),
            Record::Bad(err.to_string()),
            Some(self.error_expiry),
        );
    }

    pub fn score(&self, addr: &str) -> Score {
        match self.records.peek(addr) {
            Some(Record::Good(d)) => Score::Good(d),
            Some(Record::Bad(_)) => Score::Bad,
            None => Score::Unknown,
        }
    }

    /// 最近一次失败的错误信息
    pub fn last_error(&self, addr: &str) -> Option<String> {
        match self.records.peek(addr) {
            Some(Record::Bad(msg)) => Some(msg),
            _ => None,
        }
    }

    /// 清空所有记录，强制重新探测
    pub fn clear(&self) {
        self.records.clear();
    }

    /// (成功记录数, 失败记录数)，不含已过期的记录
    pub fn counts(&self) -> (usize, usize) {
        self.records
            .snapshot()
            .into_iter()
            .fold((0, 0), |(good, bad), (_, record)| match record {
                Record::Good(_) => (good + 1, bad),
                Record::Bad(_) => (good, bad + 1),
            })
    }
}

/// 并发拨号竞速：同时拨多个候选地址，保留最先成功的连接，其余连接在后台关闭
#[derive(Debug, Clone, Copy)]
pub struct ConnRacer {
    window: usize,
}

impl ConnRacer {
    /// `window` 为同一次竞速中同时进行的最大拨号数，至少为 1
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// 从候选地址中挑选本轮要拨的地址
    ///
    /// 候选数不超过窗口时全部使用。否则按耗时升序取最多 `max(1, W/2)` 个已知良好地址，
    /// 剩余名额依次从未知地址、多出的良好地址、已知失败地址中随机补足。
    pub fn pickup(&self, addrs: &[String], scores: &ScoreCache) -> Vec<String> {
        let w = self.window;
        if addrs.len() <= w {
            return addrs.to_vec();
        }

        let mut goods = Vec::new();
        let mut unknowns = Vec::new();
        let mut bads = Vec::new();
        for addr in addrs {
            match scores.score(addr) {
                Score::Good(d) => goods.push((d, addr.clone())),
                Score::Unknown => unknowns.push(addr.clone()),
                Score::Bad => bads.push(addr.clone()),
            }
        }

        goods.sort_by_key(|(d, _)| *d);
        let quota = (w / 2).max(1).min(goods.len());
        let spare_goods: Vec<String> = goods.split_off(quota).into_iter().map(|(_, a)| a).collect();
        let mut selected: Vec<String> = goods.into_iter().map(|(_, a)| a).collect();

        let mut rng = rand::thread_rng();
        unknowns.shuffle(&mut rng);
        bads.shuffle(&mut rng);

        let room = w - selected.len();
        selected.extend(unknowns.into_iter().chain(spare_goods).chain(bads).take(room));
        trace!("竞速候选 {:?} -> {:?}", addrs, selected);
        selected
    }

    /// 对候选地址并发拨号，返回第一个成功的连接
    ///
    /// 每次拨号的耗时或错误都会写入 `scores`。赢家确定后剩余的拨号交给后台任务，
    /// 它们完成后产生的连接会被立即关闭。全部失败时返回 `RaceExhausted`，
    /// 其中携带最后一个完成的拨号的错误。单个候选直接拨号，不启动竞速。
    pub async fn race<C, F, Fut>(
        &self,
        addrs: &[String],
        scores: &Arc<ScoreCache>,
        dial: F,
    ) -> Result<C>
    where
        C: Send + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        let selected = self.pickup(addrs, scores);

        match selected.len() {
            0 => Err(Error::NoUsableAddress {
                name: "空候选列表".to_string(),
            }),
            1 => {
                let addr = selected[0].clone();
                let fut = dial(addr.clone());
                attempt(addr, Arc::clone(scores), fut).await.1
            }
            attempts => {
                let mut set = JoinSet::new();
                for addr in selected {
                    let fut = dial(addr.clone());
                    set.spawn(attempt(addr, Arc::clone(scores), fut));
                }

                let mut last = None;
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((addr, Ok(conn))) => {
                            debug!("竞速赢家 {} ({} 个候选)", addr, attempts);
                            if !set.is_empty() {
                                tokio::spawn(drain_losers(set));
                            }
                            return Ok(conn);
                        }
                        Ok((addr, Err(e))) => {
                            debug!("竞速拨号 {} 失败: {}", addr, e);
                            last = Some(e);
                        }
                        Err(e) => {
                            last = Some(Error::Io(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                format!("拨号任务异常退出: {}", e),
                            )));
                        }
                    }
                }

                Err(Error::RaceExhausted {
                    attempts,
                    last: Box::new(last.unwrap_or(Error::DeadEnd)),
                })
            }
        }
    }
}

/// 执行一次拨号并记录耗时或错误
async fn attempt<C, Fut>(addr: String, scores: Arc<ScoreCache>, fut: Fut) -> (String, Result<C>)
where
    Fut: Future<Output = Result<C>>,
{
    let start = Instant::now();
    let result = fut.await;
    match &result {
        Ok(_) => scores.record_success(&addr, start.elapsed()),
        Err(e) => scores.record_failure(&addr, e),
    }
    (addr, result)
}

/// 等待剩余拨号全部完成，关闭它们产生的连接
async fn drain_losers<C: Send + 'static>(mut set: JoinSet<(String, Result<C>)>) {
    while let Some(joined) = set.join_next().await {
        if let Ok((addr, Ok(conn))) = joined {
            trace!("关闭竞速落败连接 {}", addr);
            drop(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scores() -> Arc<ScoreCache> {
        Arc::new(ScoreCache::new(
            128,
            Duration::from_secs(60),
            Duration::from_secs(60),
        ))
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn refused(addr: &str) -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            addr.to_string(),
        ))
    }

    /// 被丢弃时计数的假连接
    struct MockConn {
        addr: String,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for MockConn {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_pickup_prefers_good_and_skips_bad() {
        let scores = scores();
        scores.record_failure("10.0.0.1:80", &refused("10.0.0.1:80"));
        scores.record_success("10.0.0.3:80", Duration::from_millis(20));

        let racer = ConnRacer::new(2);
        let candidates = addrs(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        for _ in 0..20 {
            let mut picked = racer.pickup(&candidates, &scores);
            picked.sort();
            assert_eq!(picked, addrs(&["10.0.0.2:80", "10.0.0.3:80"]));
        }
    }

    #[test]
    fn test_pickup_small_list_uses_all() {
        let scores = scores();
        scores.record_failure("a:1", &refused("a:1"));
        let racer = ConnRacer::new(4);
        let candidates = addrs(&["a:1", "b:1", "c:1"]);
        assert_eq!(racer.pickup(&candidates, &scores), candidates);
    }

    #[test]
    fn test_pickup_bad_fills_window() {
        let scores = scores();
        for a in ["a:1", "b:1", "c:1"] {
            scores.record_failure(a, &refused(a));
        }
        scores.record_success("d:1", Duration::from_millis(5));

        let racer = ConnRacer::new(3);
        let picked = racer.pickup(&addrs(&["a:1", "b:1", "c:1", "d:1"]), &scores);
        assert_eq!(picked.len(), 3);
        assert_eq!(picked[0], "d:1");
    }

    #[test]
    fn test_pickup_goods_sorted_by_latency() {
        let scores = scores();
        scores.record_success("slow:1", Duration::from_millis(300));
        scores.record_success("fast:1", Duration::from_millis(10));
        scores.record_success("mid:1", Duration::from_millis(50));

        let racer = ConnRacer::new(4);
        let picked = racer.pickup(
            &addrs(&["slow:1", "mid:1", "fast:1", "new1:1", "new2:1"]),
            &scores,
        );
        assert_eq!(&picked[..2], &addrs(&["fast:1", "mid:1"])[..]);
        assert!(picked[2..].iter().all(|a| a.starts_with("new")));
    }

    #[tokio::test]
    async fn test_score_feedback_after_success() {
        let scores = scores();
        let racer = ConnRacer::new(2);
        let candidates = addrs(&["a:1", "b:1", "c:1", "d:1", "e:1"]);

        let winner: String = racer
            .race(&addrs(&["c:1"]), &scores, |addr| async move { Ok(addr) })
            .await
            .unwrap();
        assert_eq!(winner, "c:1");
        assert!(matches!(scores.score("c:1"), Score::Good(_)));

        for _ in 0..20 {
            assert!(racer.pickup(&candidates, &scores).contains(&"c:1".to_string()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_bound() {
        let scores = scores();
        let racer = ConnRacer::new(3);
        let candidates: Vec<String> = (0..10).map(|i| format!("10.0.0.{}:443", i)).collect();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let launched = Arc::new(AtomicUsize::new(0));

        let result: Result<String> = racer
            .race(&candidates, &scores, |addr| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                let launched = Arc::clone(&launched);
                async move {
                    launched.fetch_add(1, Ordering::SeqCst);
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Err(refused(&addr))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::RaceExhausted { attempts: 3, .. })));
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(launched.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_losers_are_closed() {
        let scores = scores();
        let racer = ConnRacer::new(4);
        let candidates = addrs(&["a:1", "b:1", "c:1", "d:1"]);
        let delays: HashMap<&str, u64> =
            [("a:1", 40), ("b:1", 10), ("c:1", 30), ("d:1", 20)].into_iter().collect();

        let drops = Arc::new(AtomicUsize::new(0));
        let opened = Arc::new(AtomicUsize::new(0));

        let winner = racer
            .race(&candidates, &scores, |addr| {
                let delay = delays[addr.as_str()];
                let drops = Arc::clone(&drops);
                let opened = Arc::clone(&opened);
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    opened.fetch_add(1, Ordering::SeqCst);
                    Ok(MockConn { addr, drops })
                }
            })
            .await
            .unwrap();

        assert_eq!(winner.addr, "b:1");

        // 等待后台任务收尾
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opened.load(Ordering::SeqCst), 4);
        assert_eq!(drops.load(Ordering::SeqCst), 3);

        drop(winner);
        assert_eq!(drops.load(Ordering::SeqCst), 4);

        // 所有拨号都写入了分数
        for a in &candidates {
            assert!(matches!(scores.score(a), Score::Good(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_fail_returns_last_error() {
        let scores = scores();
        let racer = ConnRacer::new(3);
        let candidates = addrs(&["fast:1", "slowest:1", "mid:1"]);

        let result: Result<()> = racer
            .race(&candidates, &scores, |addr| async move {
                let delay = match addr.as_str() {
                    "fast:1" => 5,
                    "mid:1" => 15,
                    _ => 50,
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Err(refused(&addr))
            })
            .await;

        match result {
            Err(Error::RaceExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("slowest:1"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        for a in &candidates {
            assert_eq!(scores.score(a), Score::Bad);
        }
    }

    #[tokio::test]
    async fn test_single_candidate_records_score() {
        let scores = scores();
        let racer = ConnRacer::new(4);

        let result: Result<()> = racer
            .race(&addrs(&["only:1"]), &scores, |addr| async move { Err(refused(&addr)) })
            .await;
        // 单个候选不包装为 RaceExhausted
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(scores.score("only:1"), Score::Bad);

        let empty: Result<()> = racer.race(&[], &scores, |_| async { Ok(()) }).await;
        assert!(matches!(empty, Err(Error::NoUsableAddress { .. })));
    }

    #[test]
    fn test_score_transitions() {
        let scores = scores();
        assert_eq!(scores.score("x:1"), Score::Unknown);
        scores.record_failure("x:1", &refused("x:1"));
        assert_eq!(scores.score("x:1"), Score::Bad);
        assert!(scores.last_error("x:1").is_some());
        scores.record_success("x:1", Duration::from_millis(7));
        assert_eq!(scores.score("x:1"), Score::Good(Duration::from_millis(7)));
        assert_eq!(scores.counts(), (1, 0));
        scores.clear();
        assert_eq!(scores.score("x:1"), Score::Unknown);
    }

    #[test]
    fn test_concurrent_writes_keep_one_record_per_addr() {
        let scores = scores();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let scores = Arc::clone(&scores);
                std::thread::spawn(move || {
                    for n in 0..200u64 {
                        if (i + n) % 2 == 0 {
                            scores.record_success("x:1", Duration::from_millis(n));
                        } else {
                            scores.record_failure("x:1", &refused("x:1"));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let (good, bad) = scores.counts();
        assert_eq!(good + bad, 1);
        match scores.score("x:1") {
            Score::Good(_) => assert!(scores.last_error("x:1").is_none()),
            Score::Bad => assert!(scores.last_error("x:1").is_some()),
            Score::Unknown => panic!("记录丢失"),
        }
    }
}
