use serde::{Deserialize, Serialize};

/// Home/draw/away probabilities summing to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeProbs {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

impl OutcomeProbs {
    pub fn uniform() -> Self {
        Self {
            home: 1.0 / 3.0,
            draw: 1.0 / 3.0,
            away: 1.0 / 3.0,
        }
    }

    pub fn sum(&self) -> f64 {
        self.home + self.draw + self.away
    }

    /// Rescales to sum 1; falls back to uniform when nothing is left to scale.
    pub fn normalized(self) -> Self {
        let sum = self.sum();
        if sum > 0.0 && sum.is_finite() {
            Self {
                home: self.home / sum,
                draw: self.draw / sum,
                away: self.away / sum,
            }
        } else {
            Self::uniform()
        }
    }

    /// Convex blend `(1 - weight) * self + weight * other`, renormalized.
    pub fn blend(self, other: OutcomeProbs, weight: f64) -> Self {
        let w = weight.clamp(0.0, 1.0);
        Self {
            home: (1.0 - w) * self.home + w * other.home,
            draw: (1.0 - w) * self.draw + w * other.draw,
            away: (1.0 - w) * self.away + w * other.away,
        }
        .normalized()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    pub lambda_home: f64,
    pub lambda_away: f64,
    pub max_goals: u32,
    pub outcome: OutcomeProbs,
    /// Most probable exact scoreline (home, away) and its probability.
    pub most_likely_score: (u32, u32),
    pub most_likely_score_probability: f64,
    pub over_2_5: f64,
    pub both_teams_score: f64,
}

/// Enumerates every scoreline `0..=max_goals` for each side under independent Poisson goal
/// counts and buckets the joint mass.
///
/// Each marginal assigns its truncated tail to `max_goals`, so the grid carries the full
/// probability mass; the outcome buckets are divided by their total as a float guard.
pub fn score_distribution(lambda_home: f64, lambda_away: f64, max_goals: u32) -> ScoreDistribution {
    let pmf_h = poisson_pmf(lambda_home, max_goals);
    let pmf_a = poisson_pmf(lambda_away, max_goals);

    let mut p_home = 0.0;
    let mut p_draw = 0.0;
    let mut p_away = 0.0;
    let mut over = 0.0;
    let mut btts = 0.0;
    let mut best = ((0u32, 0u32), -1.0);

    for (i, p_i) in pmf_h.iter().enumerate() {
        for (j, p_j) in pmf_a.iter().enumerate() {
            let p = p_i * p_j;
            if i > j {
                p_home += p;
            } else if i < j {
                p_away += p;
            } else {
                p_draw += p;
            }
            if i + j >= 3 {
                over += p;
            }
            if i > 0 && j > 0 {
                btts += p;
            }
            if p > best.1 {
                best = ((i as u32, j as u32), p);
            }
        }
    }

    let total = p_home + p_draw + p_away;
    let outcome = OutcomeProbs {
        home: p_home,
        draw: p_draw,
        away: p_away,
    }
    .normalized();
    let scale = if total > 0.0 { 1.0 / total } else { 0.0 };

    ScoreDistribution {
        lambda_home,
        lambda_away,
        max_goals,
        outcome,
        most_likely_score: best.0,
        most_likely_score_probability: best.1.max(0.0) * scale,
        over_2_5: over * scale,
        both_teams_score: btts * scale,
    }
}

pub fn outcome_probs(lambda_home: f64, lambda_away: f64, max_goals: u32) -> OutcomeProbs {
    score_distribution(lambda_home, lambda_away, max_goals).outcome
}

pub fn poisson_pmf(lambda: f64, max_k: u32) -> Vec<f64> {
    let max_k = max_k as usize;
    let mut out = vec![0.0; max_k + 1];
    let lambda = if lambda.is_finite() { lambda.max(0.0) } else { 0.0 };

    out[0] = (-lambda).exp();
    for k in 1..=max_k {
        out[k] = out[k - 1] * lambda / k as f64;
    }

    // Tail mass beyond max_k lands on the boundary count.
    let sum: f64 = out.iter().sum();
    if sum < 1.0 {
        out[max_k] += 1.0 - sum;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probabilities_sum_to_one() {
        for (lh, la) in [(0.1, 0.1), (1.4, 1.1), (3.5, 0.4), (7.0, 6.0)] {
            let d = score_distribution(lh, la, 10);
            assert!((d.outcome.sum() - 1.0).abs() < 1e-9, "{lh} {la}");
            assert!((0.0..=1.0).contains(&d.over_2_5));
            assert!((0.0..=1.0).contains(&d.both_teams_score));
        }
    }

    #[test]
    fn pmf_keeps_full_mass() {
        let pmf = poisson_pmf(4.0, 3);
        let sum: f64 = pmf.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(pmf[3] > pmf[2]);
    }

    #[test]
    fn symmetric_rates_are_symmetric() {
        let p = outcome_probs(1.3, 1.3, 10);
        assert!((p.home - p.away).abs() < 1e-12);
        assert!(p.draw > 0.2);
    }

    #[test]
    fn stronger_side_favoured() {
        let d = score_distribution(2.4, 0.6, 10);
        assert!(d.outcome.home > d.outcome.away);
        assert_eq!(d.most_likely_score, (2, 0));
    }

    #[test]
    fn blend_is_convex() {
        let a = OutcomeProbs {
            home: 0.6,
            draw: 0.3,
            away: 0.1,
        };
        let b = OutcomeProbs {
            home: 0.2,
            draw: 0.3,
            away: 0.5,
        };
        let m = a.blend(b, 0.25);
        assert!((m.home - 0.5).abs() < 1e-12);
        assert!((m.away - 0.2).abs() < 1e-12);
        let same = a.blend(b, 0.0);
        assert!((same.home - a.home).abs() < 1e-12);
    }
}
