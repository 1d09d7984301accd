/// RTT 采样记录
///
/// 每个节点保留固定数量的最近样本，快照时只统计时间窗口内的样本。
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// 节点维度的采样键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeasurementKey(String);

impl MeasurementKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 时间窗口内的 RTT 统计
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Statistics {
    #[serde(with = "millis")]
    pub min: Duration,
    #[serde(with = "millis")]
    pub max: Duration,
    #[serde(with = "millis")]
    pub average: Duration,
    #[serde(with = "millis")]
    pub stddev: Duration,
    pub samples: usize,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }
}

#[derive(Debug)]
pub struct RttRecorder {
    capacity: usize,
    samples: Mutex<HashMap<MeasurementKey, VecDeque<(Instant, Duration)>>>,
}

impl RttRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, key: &MeasurementKey, rtt: Duration) {
        self.record_at(key, rtt, Instant::now());
    }

    fn record_at(&self, key: &MeasurementKey, rtt: Duration, at: Instant) {
        let mut samples = self.samples.lock();
        let ring = samples
            .entry(key.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back((at, rtt));
    }

    /// 统计最近 `window` 内的样本；没有样本时返回 None
    pub fn snapshot(&self, key: &MeasurementKey, window: Duration) -> Option<Statistics> {
        let samples = self.samples.lock();
        let ring = samples.get(key)?;
        let now = Instant::now();

        let recent: Vec<Duration> = ring
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= window)
            .map(|(_, rtt)| *rtt)
            .collect();
        let (min, max) = match (recent.iter().min(), recent.iter().max()) {
            (Some(min), Some(max)) => (*min, *max),
            _ => return None,
        };

        let n = recent.len() as f64;
        let mean = recent.iter().map(Duration::as_secs_f64).sum::<f64>() / n;
        let variance = recent
            .iter()
            .map(|v| (v.as_secs_f64() - mean).powi(2))
            .sum::<f64>()
            / n;

        Some(Statistics {
            min,
            max,
            average: Duration::from_secs_f64(mean),
            stddev: Duration::from_secs_f64(variance.sqrt()),
            samples: recent.len(),
        })
    }

    pub fn forget(&self, key: &MeasurementKey) {
        self.samples.lock().remove(key);
    }
}
