use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Tolerance for the enabled-weights-sum-to-100 check and for grade band
/// partition validation.
pub const WEIGHT_EPSILON: f64 = 0.01;

/// Float-noise guard for classification. Totals are rounded to two
/// decimals, so this must stay far below 0.01 or boundary scores would
/// jump bands.
const SCORE_EPSILON: f64 = 1e-9;

/// Two-decimal rounding applied to weighted scores and totals so that
/// float noise never flips a band boundary.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    First,
    Second,
}

impl Period {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first" => Some(Self::First),
            "second" => Some(Self::Second),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Second => "second",
        }
    }
}

/// Scored dimensions of student performance. `SCORING_ORDER` is the
/// aggregator's sequencing contract: Activity runs last because its
/// reserve cap consumes the other components' running total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Labs,
    Attendance,
    Tests,
    Activity,
}

impl ComponentKind {
    pub const SCORING_ORDER: [ComponentKind; 4] = [
        ComponentKind::Labs,
        ComponentKind::Attendance,
        ComponentKind::Tests,
        ComponentKind::Activity,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Labs => "labs",
            Self::Attendance => "attendance",
            Self::Tests => "tests",
            Self::Activity => "activity",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub label: String,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodConfig {
    pub period: Period,
    pub max_points: f64,
    pub min_passing_points: f64,
    pub grade_bands: Vec<GradeBand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradingMode {
    Binary,
    Graded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabsConfig {
    pub enabled: bool,
    pub weight: f64,
    pub grading_mode: GradingMode,
    pub grading_scale: f64,
    pub required_count: u32,
    pub bonus_per_extra: f64,
    pub soft_deadline_days: i64,
    pub soft_deadline_penalty: f64,
    pub hard_deadline_penalty: f64,
    /// When true, the extra-submission bonus is subject to the same
    /// period-reserve cap as Activity bonuses. Default false: the bonus
    /// is only bounded by the final clamp to the period maximum.
    #[serde(default)]
    pub bonus_capped_by_reserve: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceMode {
    PerClass,
    Percentage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceConfig {
    pub enabled: bool,
    pub weight: f64,
    pub mode: AttendanceMode,
    pub points_per_class: f64,
    pub max_points: f64,
    /// Fraction of presence credit a late mark earns. Institution policy;
    /// 1.0 treats late as fully present.
    pub late_weight: f64,
    pub excused_counts: bool,
    pub penalty_enabled: bool,
    pub penalty_per_absence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestsConfig {
    pub enabled: bool,
    pub weight: f64,
    pub grading_scale: f64,
    pub required_count: u32,
    pub retakes_allowed: bool,
    pub max_retakes: u32,
    pub retake_penalty: f64,
    #[serde(default)]
    pub best_of: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityConfig {
    pub enabled: bool,
    pub weight: f64,
    pub max_points: f64,
    pub points_per_entry: f64,
    pub allow_negative: bool,
    pub negative_limit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentsConfig {
    pub labs: LabsConfig,
    pub attendance: AttendanceConfig,
    pub tests: TestsConfig,
    pub activity: ActivityConfig,
}

#[derive(Debug, Clone)]
pub struct LabSubmission {
    pub grade: Option<f64>,
    pub submitted_at: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Late,
    Excused,
    Absent,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "late" => Some(Self::Late),
            "excused" => Some(Self::Excused),
            "absent" => Some(Self::Absent),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Late => "late",
            Self::Excused => "excused",
            Self::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceMark {
    // Kept for callers that need the session a mark belongs to; the
    // scorer itself only counts statuses.
    #[allow(dead_code)]
    pub date: NaiveDate,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub points: Option<f64>,
    #[allow(dead_code)]
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct TestSubmission {
    pub test_no: i64,
    pub attempt: i64,
    pub grade: Option<f64>,
    pub taken_at: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
}

/// Everything the engine needs for one student. Fetched by the caller;
/// the engine itself never reads storage or ambient configuration.
#[derive(Debug, Clone, Default)]
pub struct StudentInputs {
    pub labs: Vec<LabSubmission>,
    pub attendance: Vec<AttendanceMark>,
    /// Scheduled class count for the period, supplied externally from the
    /// session calendar. The engine never infers it from the marks.
    pub total_classes: usize,
    pub tests: Vec<TestSubmission>,
    pub activity: Vec<ActivityEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBreakdown {
    pub kind: ComponentKind,
    /// Labs/tests: fulfillment ratio in [0,1]. Attendance: attended
    /// fraction. Activity: signed entry sum before caps.
    pub raw_score: f64,
    pub weighted_score: f64,
    pub max_possible: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_count: Option<usize>,
    pub invalid_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excused_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absent_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonus_points: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonus_blocked: Option<bool>,
}

impl ComponentBreakdown {
    fn empty(kind: ComponentKind, max_possible: f64) -> Self {
        Self {
            kind,
            raw_score: 0.0,
            weighted_score: 0.0,
            max_possible,
            submitted_count: None,
            required_count: None,
            extra_count: None,
            invalid_count: 0,
            present_count: None,
            late_count: None,
            excused_count: None,
            absent_count: None,
            entry_count: None,
            bonus_points: None,
            bonus_blocked: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationResult {
    pub student_id: String,
    pub period: Period,
    pub total_score: f64,
    pub grade_label: String,
    pub is_passing: bool,
    pub breakdown: Vec<ComponentBreakdown>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAttestationResult {
    pub scope_id: String,
    pub period: Period,
    pub count: usize,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub passing_count: usize,
    pub failing_count: usize,
    pub grade_histogram: BTreeMap<String, usize>,
    pub per_student: Vec<AttestationResult>,
}

/// Budget a component's weight buys out of the period's point pool.
fn weight_points(weight: f64, period_max: f64) -> f64 {
    weight / 100.0 * period_max
}

/// Maps a grade on the institution's scale (5/10/100-point) onto [0,1].
/// Out-of-scale grades are malformed records: `None`, excluded by the
/// caller and tallied in the breakdown, never escalated.
fn normalize_grade(grade: f64, scale: f64) -> Option<f64> {
    if grade < 0.0 || grade > scale {
        return None;
    }
    Some(grade / scale)
}

/// Timeliness multiplier for one submission. A missing submission date
/// means not-yet-submitted: the value is zeroed out of the numerator but
/// the required-count denominator is unaffected. A deadline in the future
/// (or no deadline at all) is timely.
pub fn deadline_multiplier(
    submitted_at: Option<NaiveDate>,
    deadline: Option<NaiveDate>,
    soft_days: i64,
    soft_penalty: f64,
    hard_penalty: f64,
) -> f64 {
    let Some(submitted) = submitted_at else {
        return 0.0;
    };
    let Some(deadline) = deadline else {
        return 1.0;
    };
    if submitted <= deadline {
        return 1.0;
    }
    if submitted <= deadline + Duration::days(soft_days) {
        return soft_penalty;
    }
    hard_penalty
}

fn check_fraction(value: f64, name: &str) -> Result<(), ScoreError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ScoreError::with_details(
            "config_invalid",
            format!("{} must be within [0, 1]", name),
            serde_json::json!({ "value": value }),
        ));
    }
    Ok(())
}

fn check_non_negative(value: f64, name: &str) -> Result<(), ScoreError> {
    if value < 0.0 {
        return Err(ScoreError::with_details(
            "config_invalid",
            format!("{} must be >= 0", name),
            serde_json::json!({ "value": value }),
        ));
    }
    Ok(())
}

/// Weight-sum and per-parameter validation for the enabled components.
/// Runs before any student data is read; a misconfigured period refuses
/// to score rather than silently normalizing weights.
pub fn validate_components(cfg: &ComponentsConfig) -> Result<(), ScoreError> {
    let mut sum = 0.0;
    for (kind, enabled, weight) in [
        (ComponentKind::Labs, cfg.labs.enabled, cfg.labs.weight),
        (
            ComponentKind::Attendance,
            cfg.attendance.enabled,
            cfg.attendance.weight,
        ),
        (ComponentKind::Tests, cfg.tests.enabled, cfg.tests.weight),
        (
            ComponentKind::Activity,
            cfg.activity.enabled,
            cfg.activity.weight,
        ),
    ] {
        if !enabled {
            continue;
        }
        if !(0.0..=100.0).contains(&weight) {
            return Err(ScoreError::with_details(
                "config_invalid",
                format!("{} weight must be within [0, 100]", kind.key()),
                serde_json::json!({ "weight": weight }),
            ));
        }
        sum += weight;
    }
    if (sum - 100.0).abs() >= WEIGHT_EPSILON {
        return Err(ScoreError::with_details(
            "config_invalid",
            "enabled component weights must sum to 100",
            serde_json::json!({ "weightSum": sum }),
        ));
    }

    if cfg.labs.enabled {
        if cfg.labs.required_count == 0 {
            return Err(ScoreError::new(
                "config_invalid",
                "labs requiredCount must be > 0",
            ));
        }
        if cfg.labs.grading_scale <= 0.0 {
            return Err(ScoreError::new(
                "config_invalid",
                "labs gradingScale must be > 0",
            ));
        }
        if cfg.labs.soft_deadline_days < 0 {
            return Err(ScoreError::new(
                "config_invalid",
                "labs softDeadlineDays must be >= 0",
            ));
        }
        check_fraction(cfg.labs.soft_deadline_penalty, "labs softDeadlinePenalty")?;
        check_fraction(cfg.labs.hard_deadline_penalty, "labs hardDeadlinePenalty")?;
        check_non_negative(cfg.labs.bonus_per_extra, "labs bonusPerExtra")?;
    }

    if cfg.attendance.enabled {
        check_non_negative(cfg.attendance.points_per_class, "attendance pointsPerClass")?;
        check_non_negative(cfg.attendance.max_points, "attendance maxPoints")?;
        check_non_negative(
            cfg.attendance.penalty_per_absence,
            "attendance penaltyPerAbsence",
        )?;
        check_fraction(cfg.attendance.late_weight, "attendance lateWeight")?;
        if cfg.attendance.mode == AttendanceMode::Percentage && cfg.attendance.max_points <= 0.0 {
            return Err(ScoreError::new(
                "config_invalid",
                "attendance maxPoints must be > 0 in percentage mode",
            ));
        }
    }

    if cfg.tests.enabled {
        if cfg.tests.required_count == 0 {
            return Err(ScoreError::new(
                "config_invalid",
                "tests requiredCount must be > 0",
            ));
        }
        if cfg.tests.grading_scale <= 0.0 {
            return Err(ScoreError::new(
                "config_invalid",
                "tests gradingScale must be > 0",
            ));
        }
        check_fraction(cfg.tests.retake_penalty, "tests retakePenalty")?;
        if let Some(n) = cfg.tests.best_of {
            if n == 0 {
                return Err(ScoreError::new("config_invalid", "tests bestOf must be > 0"));
            }
        }
    }

    if cfg.activity.enabled {
        check_non_negative(cfg.activity.max_points, "activity maxPoints")?;
        check_non_negative(cfg.activity.negative_limit, "activity negativeLimit")?;
    }

    Ok(())
}

/// Grade bands must partition [0, maxPoints]: contiguous, ascending,
/// first lower at 0, last upper at the period maximum.
pub fn validate_period(cfg: &PeriodConfig) -> Result<(), ScoreError> {
    if cfg.max_points <= 0.0 {
        return Err(ScoreError::new("config_invalid", "maxPoints must be > 0"));
    }
    if cfg.min_passing_points < 0.0 || cfg.min_passing_points > cfg.max_points {
        return Err(ScoreError::new(
            "config_invalid",
            "minPassingPoints must be within [0, maxPoints]",
        ));
    }
    if cfg.grade_bands.is_empty() {
        return Err(ScoreError::new("config_invalid", "gradeBands must not be empty"));
    }

    let mut bands: Vec<&GradeBand> = cfg.grade_bands.iter().collect();
    bands.sort_by(|a, b| a.lower.partial_cmp(&b.lower).unwrap_or(Ordering::Equal));

    for b in &bands {
        if b.upper < b.lower {
            return Err(ScoreError::with_details(
                "config_invalid",
                "grade band upper must be >= lower",
                serde_json::json!({ "label": b.label }),
            ));
        }
    }
    if bands[0].lower.abs() >= WEIGHT_EPSILON {
        return Err(ScoreError::new(
            "config_invalid",
            "lowest grade band must start at 0",
        ));
    }
    if (bands[bands.len() - 1].upper - cfg.max_points).abs() >= WEIGHT_EPSILON {
        return Err(ScoreError::new(
            "config_invalid",
            "highest grade band must end at maxPoints",
        ));
    }
    for pair in bands.windows(2) {
        if (pair[1].lower - pair[0].upper).abs() >= WEIGHT_EPSILON {
            return Err(ScoreError::with_details(
                "config_invalid",
                "grade bands must be contiguous",
                serde_json::json!({ "after": pair[0].label, "before": pair[1].label }),
            ));
        }
    }
    Ok(())
}

/// First matching band in descending order of lower bound wins; a shared
/// boundary point therefore resolves to the higher band. No match is a
/// configuration defect and is propagated, never defaulted.
pub fn classify(total_score: f64, bands: &[GradeBand]) -> Result<String, ScoreError> {
    let mut ordered: Vec<&GradeBand> = bands.iter().collect();
    ordered.sort_by(|a, b| b.lower.partial_cmp(&a.lower).unwrap_or(Ordering::Equal));
    for band in ordered {
        if total_score >= band.lower - SCORE_EPSILON && total_score <= band.upper + SCORE_EPSILON {
            return Ok(band.label.clone());
        }
    }
    Err(ScoreError::with_details(
        "no_grade_band",
        "no grade band matches the total score",
        serde_json::json!({ "totalScore": total_score }),
    ))
}

/// Labs raw/weighted score. The extra-submission bonus is returned
/// separately in `bonus_points`; the aggregator folds it into the
/// weighted score so the reserve flag has a well-defined point to apply.
fn score_labs(cfg: &LabsConfig, subs: &[LabSubmission], period_max: f64) -> ComponentBreakdown {
    let cap = weight_points(cfg.weight, period_max);
    let mut bd = ComponentBreakdown::empty(ComponentKind::Labs, cap);

    let mut values: Vec<f64> = Vec::new();
    let mut invalid = 0usize;
    for s in subs {
        let Some(grade) = s.grade else {
            // Not yet graded: out of the numerator, denominator unchanged.
            continue;
        };
        if normalize_grade(grade, cfg.grading_scale).is_none() {
            invalid += 1;
            continue;
        }
        let mult = deadline_multiplier(
            s.submitted_at,
            s.deadline,
            cfg.soft_deadline_days,
            cfg.soft_deadline_penalty,
            cfg.hard_deadline_penalty,
        );
        let value = match cfg.grading_mode {
            GradingMode::Graded => (grade / cfg.grading_scale) * mult,
            // Binary: an accepted submission counts as one, degraded only
            // by lateness.
            GradingMode::Binary => mult,
        };
        values.push(value);
    }

    values.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let required = cfg.required_count as usize;
    let counted: f64 = values.iter().take(required).sum();
    let raw = (counted / required as f64).clamp(0.0, 1.0);
    let extra = values.len().saturating_sub(required);

    bd.raw_score = raw;
    bd.weighted_score = round2((raw * cap).min(cap));
    bd.submitted_count = Some(values.len());
    bd.required_count = Some(required);
    bd.extra_count = Some(extra);
    bd.invalid_count = invalid;
    bd.bonus_points = Some(round2(extra as f64 * cfg.bonus_per_extra));
    bd
}

fn score_attendance(
    cfg: &AttendanceConfig,
    marks: &[AttendanceMark],
    total_classes: usize,
    period_max: f64,
) -> ComponentBreakdown {
    let budget = weight_points(cfg.weight, period_max);
    let cap = if cfg.max_points > 0.0 { cfg.max_points } else { budget };
    let mut bd = ComponentBreakdown::empty(ComponentKind::Attendance, cap);

    let mut present = 0usize;
    let mut late = 0usize;
    let mut excused = 0usize;
    let mut absent = 0usize;
    for m in marks {
        match m.status {
            AttendanceStatus::Present => present += 1,
            AttendanceStatus::Late => late += 1,
            AttendanceStatus::Excused => excused += 1,
            AttendanceStatus::Absent => absent += 1,
        }
    }

    let excused_weight = if cfg.excused_counts { 1.0 } else { 0.0 };
    let attended =
        present as f64 + late as f64 * cfg.late_weight + excused as f64 * excused_weight;
    let ratio = if total_classes > 0 {
        (attended / total_classes as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let weighted = match cfg.mode {
        AttendanceMode::PerClass => {
            let mut pts = cfg.points_per_class * attended;
            if cfg.penalty_enabled {
                pts -= cfg.penalty_per_absence * absent as f64;
            }
            // Attendance is not a penalty channel: floor at zero.
            pts.clamp(0.0, cap)
        }
        AttendanceMode::Percentage => ratio * cap,
    };

    bd.raw_score = ratio;
    bd.weighted_score = round2(weighted);
    bd.present_count = Some(present);
    bd.late_count = Some(late);
    bd.excused_count = Some(excused);
    bd.absent_count = Some(absent);
    bd
}

fn score_tests(cfg: &TestsConfig, subs: &[TestSubmission], period_max: f64) -> ComponentBreakdown {
    let cap = weight_points(cfg.weight, period_max);
    let mut bd = ComponentBreakdown::empty(ComponentKind::Tests, cap);

    // Best surviving value per distinct test, retake policy applied.
    let mut best_by_test: BTreeMap<i64, f64> = BTreeMap::new();
    let mut invalid = 0usize;
    for s in subs {
        let Some(grade) = s.grade else {
            continue;
        };
        let Some(normalized) = normalize_grade(grade, cfg.grading_scale) else {
            invalid += 1;
            continue;
        };
        let retake_index = (s.attempt - 1).max(0);
        if !cfg.retakes_allowed && retake_index > 0 {
            continue;
        }
        if cfg.retakes_allowed && retake_index > cfg.max_retakes as i64 {
            continue;
        }
        // Tests usually carry no deadline; only a dated deadline with a
        // missing taken_at zeroes the attempt.
        let mult = if s.deadline.is_some() {
            deadline_multiplier(s.taken_at, s.deadline, 0, 1.0, 1.0)
        } else {
            1.0
        };
        let value =
            (normalized * (1.0 - cfg.retake_penalty * retake_index as f64).max(0.0)) * mult;
        let slot = best_by_test.entry(s.test_no).or_insert(0.0);
        if value > *slot {
            *slot = value;
        }
    }

    let mut values: Vec<f64> = best_by_test.into_values().collect();
    values.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));

    let denom = cfg.best_of.unwrap_or(cfg.required_count) as usize;
    let counted: f64 = values.iter().take(denom).sum();
    let raw = if denom > 0 {
        (counted / denom as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };

    bd.raw_score = raw;
    bd.weighted_score = round2(raw * cap);
    bd.submitted_count = Some(values.len());
    bd.required_count = Some(cfg.required_count as usize);
    bd.invalid_count = invalid;
    bd
}

/// Activity runs after every other component: positive totals are capped
/// by the component maximum and by the remaining period reserve, negative
/// totals bypass the reserve but are floored at the negative limit.
fn score_activity(
    cfg: &ActivityConfig,
    entries: &[ActivityEntry],
    other_total: f64,
    period_max: f64,
) -> ComponentBreakdown {
    let mut bd = ComponentBreakdown::empty(ComponentKind::Activity, cfg.max_points);

    let raw: f64 = entries
        .iter()
        .map(|e| e.points.unwrap_or(cfg.points_per_entry))
        .sum();

    let applied = if raw >= 0.0 {
        let reserve = (period_max - other_total).max(0.0);
        let applied = raw.min(cfg.max_points).min(reserve);
        if raw > 0.0 && applied + WEIGHT_EPSILON < raw {
            bd.bonus_blocked = Some(true);
        }
        applied
    } else if cfg.allow_negative {
        raw.max(-cfg.negative_limit)
    } else {
        0.0
    };

    bd.raw_score = round2(raw);
    bd.weighted_score = round2(applied);
    bd.entry_count = Some(entries.len());
    bd
}

/// Scores one student. Validates configuration first (weights, bands,
/// parameters), then runs the components in `SCORING_ORDER`, applies the
/// labs extra bonus, hands the running total to Activity, clamps to
/// [0, maxPoints] and classifies. Pure and deterministic.
pub fn compute_one(
    student_id: &str,
    period_cfg: &PeriodConfig,
    components: &ComponentsConfig,
    inputs: &StudentInputs,
) -> Result<AttestationResult, ScoreError> {
    validate_period(period_cfg)?;
    validate_components(components)?;

    let max = period_cfg.max_points;
    let mut breakdown: Vec<ComponentBreakdown> = Vec::new();
    let mut running = 0.0f64;

    for kind in ComponentKind::SCORING_ORDER {
        if kind == ComponentKind::Activity {
            // The labs extra bonus lands after every raw-capped portion
            // and before Activity reads the running total, so the
            // reserve flag measures headroom against everything but
            // Activity itself.
            if let Some(bd) = breakdown
                .iter_mut()
                .find(|b| b.kind == ComponentKind::Labs)
            {
                let bonus = bd.bonus_points.unwrap_or(0.0);
                let applied = if components.labs.bonus_capped_by_reserve {
                    bonus.min((max - running).max(0.0))
                } else {
                    bonus
                };
                bd.weighted_score = round2(bd.weighted_score + applied);
                bd.bonus_points = Some(round2(applied));
                running += applied;
            }
        }

        let bd = match kind {
            ComponentKind::Labs => {
                if !components.labs.enabled {
                    continue;
                }
                score_labs(&components.labs, &inputs.labs, max)
            }
            ComponentKind::Attendance => {
                if !components.attendance.enabled {
                    continue;
                }
                score_attendance(
                    &components.attendance,
                    &inputs.attendance,
                    inputs.total_classes,
                    max,
                )
            }
            ComponentKind::Tests => {
                if !components.tests.enabled {
                    continue;
                }
                score_tests(&components.tests, &inputs.tests, max)
            }
            ComponentKind::Activity => {
                if !components.activity.enabled {
                    continue;
                }
                score_activity(&components.activity, &inputs.activity, running, max)
            }
        };
        running += bd.weighted_score;
        breakdown.push(bd);
    }

    let total = round2(running).clamp(0.0, max);
    let grade_label = classify(total, &period_cfg.grade_bands)?;
    let is_passing = total >= period_cfg.min_passing_points;

    Ok(AttestationResult {
        student_id: student_id.to_string(),
        period: period_cfg.period,
        total_score: total,
        grade_label,
        is_passing,
        breakdown,
    })
}

/// Scores a whole scope. Live members are computed fresh; `frozen`
/// carries the immutable snapshot results of students who left the scope
/// mid-period, included in the fold untouched. The fold is a commutative,
/// associative reduction, so member order never changes the aggregates.
/// An empty scope folds to identity values, not an error.
pub fn compute_group(
    scope_id: &str,
    period_cfg: &PeriodConfig,
    components: &ComponentsConfig,
    members: &[(String, StudentInputs)],
    frozen: Vec<AttestationResult>,
) -> Result<GroupAttestationResult, ScoreError> {
    validate_period(period_cfg)?;
    validate_components(components)?;

    let mut per_student: Vec<AttestationResult> = Vec::with_capacity(members.len() + frozen.len());
    for (student_id, inputs) in members {
        per_student.push(compute_one(student_id, period_cfg, components, inputs)?);
    }
    per_student.extend(frozen);

    let count = per_student.len();
    let mut sum = 0.0f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut passing_count = 0usize;
    let mut grade_histogram: BTreeMap<String, usize> = BTreeMap::new();
    for r in &per_student {
        sum += r.total_score;
        if r.total_score < min {
            min = r.total_score;
        }
        if r.total_score > max {
            max = r.total_score;
        }
        if r.is_passing {
            passing_count += 1;
        }
        *grade_histogram.entry(r.grade_label.clone()).or_insert(0) += 1;
    }

    let (average, min, max) = if count > 0 {
        (round2(sum / count as f64), min, max)
    } else {
        (0.0, 0.0, 0.0)
    };

    Ok(GroupAttestationResult {
        scope_id: scope_id.to_string(),
        period: period_cfg.period,
        count,
        average,
        min,
        max,
        passing_count,
        failing_count: count - passing_count,
        grade_histogram,
        per_student,
    })
}
