use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Random loss and delay applied to frames crossing a [`Tunnel`](crate::testkit::Tunnel).
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FailureConfig {
  /// Probability in `[0, 1]` that a frame is dropped.
  pub drop_prob: f64,
  /// Frames that survive are held back for a uniformly random time in this range.
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  pub fn drops<R: Rng>(&self, rng: &mut R) -> bool {
    self.drop_prob > 0.0 && rng.gen::<f64>() < self.drop_prob
  }

  pub fn delay<R: Rng>(&self, rng: &mut R) -> Option<Duration> {
    self.delay.map(|(min, max)| {
      if max <= min {
        return min;
      }
      let range = min.as_millis()..=max.as_millis();
      Duration::from_millis(rng.gen_range(range) as u64)
    })
  }
}

#[test]
fn test_failure_config() {
  use rand::rngs::SmallRng;
  use rand::SeedableRng;
  let mut rng = SmallRng::seed_from_u64(7);
  let never = FailureConfig::default();
  let always = FailureConfig {
    drop_prob: 1.0,
    delay: Some((Duration::from_millis(10), Duration::from_millis(20))),
  };
  for _ in 0..100 {
    assert!(!never.drops(&mut rng));
    assert!(always.drops(&mut rng));
    let d = always.delay(&mut rng).unwrap();
    assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
  }
  assert_eq!(never.delay(&mut rng), None);
}
