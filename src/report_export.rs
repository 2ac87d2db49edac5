use std::path::Path;

use anyhow::{Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};

use crate::predict::PredictionResult;
use crate::rbs::{RbsBatch, RbsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportReport {
    pub rows: usize,
    pub sheets: usize,
}

/// Writes an RBS batch as `Scores` (one row per pair) and `Run` (batch metadata) sheets.
pub fn export_rbs_batch(path: &Path, batch: &RbsBatch) -> Result<ExportReport> {
    let score_rows = rbs_rows(&batch.results);
    let run_rows = vec![
        vec!["field".to_string(), "value".to_string()],
        vec!["preset".to_string(), batch.preset.name().to_string()],
        vec!["as_of".to_string(), batch.as_of.to_string()],
        vec!["config".to_string(), batch.config_used.clone()],
        vec!["pairs".to_string(), batch.results.len().to_string()],
        vec!["scored".to_string(), batch.scored.to_string()],
        vec!["insufficient".to_string(), batch.insufficient.to_string()],
    ];

    let mut workbook = Workbook::new();
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Scores")?;
        write_rows(sheet, &score_rows)?;
    }
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Run")?;
        write_rows(sheet, &run_rows)?;
    }

    workbook
        .save(path)
        .with_context(|| format!("failed writing workbook to {}", path.display()))?;

    Ok(ExportReport {
        rows: score_rows.len().saturating_sub(1),
        sheets: 2,
    })
}

/// Writes one row per prediction plus a `Components` sheet with each side's blend inputs.
pub fn export_predictions(path: &Path, predictions: &[PredictionResult]) -> Result<ExportReport> {
    let mut summary_rows = vec![
        [
            "home_team",
            "away_team",
            "referee",
            "config",
            "methods",
            "home_xg",
            "away_xg",
            "p_home",
            "p_draw",
            "p_away",
            "most_likely_score",
            "over_2_5",
            "both_teams_score",
            "confidence",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>(),
    ];
    let mut component_rows = vec![
        [
            "fixture",
            "side",
            "team",
            "shot_based",
            "conversion_multiplier",
            "historical",
            "opponent_defense",
            "dropped",
            "base_rate",
            "rbs_multiplier",
            "expected_goals",
            "effective_sample",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>(),
    ];

    for p in predictions {
        let fixture = format!("{} v {}", p.home_team, p.away_team);
        let breakdown = &p.prediction_breakdown;
        summary_rows.push(vec![
            p.home_team.clone(),
            p.away_team.clone(),
            p.referee.clone().unwrap_or_default(),
            breakdown.config_used.clone(),
            breakdown.methods.join("+"),
            format!("{:.3}", p.predicted_home_goals),
            format!("{:.3}", p.predicted_away_goals),
            format!("{:.4}", p.home_win_probability),
            format!("{:.4}", p.draw_probability),
            format!("{:.4}", p.away_win_probability),
            format!("{}-{}", p.most_likely_score.0, p.most_likely_score.1),
            format!("{:.4}", p.over_2_5_probability),
            format!("{:.4}", p.both_teams_score_probability),
            format!("{:.1}", p.confidence),
        ]);
        for (label, side) in [("home", &breakdown.home), ("away", &breakdown.away)] {
            component_rows.push(vec![
                fixture.clone(),
                label.to_string(),
                side.team.clone(),
                opt_to_string(side.shot_based.map(fmt3)),
                opt_to_string(side.conversion_multiplier.map(fmt3)),
                opt_to_string(side.historical.map(fmt3)),
                opt_to_string(side.opponent_defense.map(fmt3)),
                side.dropped_components.join(","),
                fmt3(side.base_rate),
                fmt3(side.rbs_multiplier),
                fmt3(side.expected_goals),
                fmt3(side.effective_sample_weight),
            ]);
        }
    }

    let mut workbook = Workbook::new();
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Predictions")?;
        write_rows(sheet, &summary_rows)?;
    }
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Components")?;
        write_rows(sheet, &component_rows)?;
    }

    workbook
        .save(path)
        .with_context(|| format!("failed writing workbook to {}", path.display()))?;

    Ok(ExportReport {
        rows: summary_rows.len().saturating_sub(1),
        sheets: 2,
    })
}

fn rbs_rows(results: &[RbsResult]) -> Vec<Vec<String>> {
    // Every result carries the same configured keys, so the first one fixes the columns.
    let stat_columns: Vec<_> = results
        .first()
        .map(|r| r.stats_breakdown.keys().copied().collect())
        .unwrap_or_default();

    let mut header: Vec<String> = [
        "team",
        "referee",
        "status",
        "rbs_score",
        "confidence",
        "matches_with_ref",
        "effective_matches_with_ref",
        "baseline_matches",
        "reason",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend(stat_columns.iter().map(|k| k.name().to_string()));

    let mut rows = vec![header];
    for r in results {
        let status = if r.is_scored() {
            "scored"
        } else {
            "insufficient_data"
        };
        let mut row = vec![
            r.team.clone(),
            r.referee.clone(),
            status.to_string(),
            opt_to_string(r.rbs_score.map(|v| format!("{v:.4}"))),
            opt_to_string(r.confidence_level.map(|v| format!("{v:.1}"))),
            r.matches_with_ref.to_string(),
            fmt3(r.effective_matches_with_ref),
            r.baseline_matches.to_string(),
            r.insufficient_reason().unwrap_or_default().to_string(),
        ];
        row.extend(stat_columns.iter().map(|k| {
            opt_to_string(r.stats_breakdown.get(k).copied().flatten().map(fmt3))
        }));
        rows.push(row);
    }
    rows
}

fn fmt3(value: f64) -> String {
    format!("{value:.3}")
}

fn opt_to_string<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn write_rows(worksheet: &mut Worksheet, rows: &[Vec<String>]) -> Result<()> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            worksheet
                .write_string(row_idx as u32, col_idx as u16, value)
                .with_context(|| format!("write cell ({row_idx},{col_idx})"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;

    use super::*;
    use crate::decay::DecayPreset;
    use crate::observations::StatKey;
    use crate::rbs::RbsStatus;

    fn result(team: &str, scored: bool) -> RbsResult {
        let mut breakdown = BTreeMap::new();
        breakdown.insert(StatKey::YellowCards, scored.then_some(-0.5));
        breakdown.insert(StatKey::FoulsCommitted, None);
        RbsResult {
            team: team.to_string(),
            referee: "M. Oliver".to_string(),
            preset: DecayPreset::Moderate,
            as_of: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            config_used: "default".to_string(),
            status: if scored {
                RbsStatus::Scored
            } else {
                RbsStatus::InsufficientData {
                    reason: "1 match with referee".to_string(),
                }
            },
            rbs_score: scored.then_some(0.12),
            confidence_level: scored.then_some(44.0),
            stats_breakdown: breakdown,
            components: Vec::new(),
            matches_with_ref: if scored { 4 } else { 1 },
            effective_matches_with_ref: 3.2,
            baseline_matches: 20,
            effective_baseline_matches: 14.0,
        }
    }

    #[test]
    fn rbs_rows_have_one_column_per_stat() {
        let rows = rbs_rows(&[result("Arsenal", true), result("Everton", false)]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].len(), 11);
        assert!(rows.iter().all(|r| r.len() == rows[0].len()));
        assert_eq!(rows[1][3], "0.1200");
        assert_eq!(rows[2][2], "insufficient_data");
        assert_eq!(rows[2][3], "");
        assert_eq!(rows[2][8], "1 match with referee");
    }

    #[test]
    fn writes_rbs_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rbs.xlsx");
        let batch = RbsBatch {
            preset: DecayPreset::Moderate,
            as_of: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            config_used: "default".to_string(),
            scored: 1,
            insufficient: 1,
            results: vec![result("Arsenal", true), result("Everton", false)],
        };
        let report = export_rbs_batch(&path, &batch).unwrap();
        assert_eq!(report, ExportReport { rows: 2, sheets: 2 });
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
