use proptest::prelude::*;

use sectorflow_allocation::merge::SecondaryTable;
use sectorflow_allocation::{
    run, AllocError, AllocationPlan, EngineContext, FunctionRegistry, InMemorySource, Partition,
    RunResult, Stage,
};
use sectorflow_core::{FlowAmount, FlowRecord, Provenance, SectorLengthCrosswalk};

// -------------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------------

fn ctx() -> EngineContext {
    EngineContext::new(SectorLengthCrosswalk::from_numeric_codes([
        "111", "112", "113", "1121", "1122", "211", "212", "334",
    ]))
}

fn plan(toml: &str) -> AllocationPlan {
    AllocationPlan::from_toml(toml, &FunctionRegistry::new()).unwrap()
}

fn primary(location: &str, activity: &str, sector: &str, amount: FlowAmount, unit: &str) -> FlowRecord {
    FlowRecord {
        location: location.into(),
        activity_consumed_by: Some(activity.into()),
        sector_consumed_by: Some(sector.into()),
        sector_source_name: "NAICS_2012_Code".into(),
        flow_name: "Water".into(),
        unit: unit.into(),
        year: 2015,
        flow_amount: amount,
        ..Default::default()
    }
}

fn weight(location: &str, sector: &str, amount: f64, unit: &str) -> FlowRecord {
    FlowRecord {
        location: location.into(),
        activity_produced_by: Some("Employment".into()),
        sector_produced_by: Some(sector.into()),
        flow_name: "Number of employees".into(),
        unit: unit.into(),
        year: 2015,
        flow_amount: FlowAmount::Value(amount),
        ..Default::default()
    }
}

fn partition(activity_set: &str, records: Vec<FlowRecord>) -> Partition {
    Partition {
        source: "USGS_NWIS_WU".into(),
        activity_set: activity_set.into(),
        year: 2015,
        records,
    }
}

fn amount_at(result: &RunResult, location: &str, sector: &str) -> FlowAmount {
    result
        .records()
        .find(|r| r.location == location && r.sector_consumed_by.as_deref() == Some(sector))
        .map(|r| r.flow_amount)
        .unwrap_or_else(|| panic!("no output row for {location}/{sector}"))
}

fn close(a: FlowAmount, b: f64) -> bool {
    a.value().is_some_and(|v| (v - b).abs() < 1e-6)
}

const STATE_PROPORTIONAL: &str = r#"
name = "Water_state_2015"
target_sector_level = 3

[[activity_sets]]
name = "crops"
names = ["Crops"]
geographic_scale = "state"

[[activity_sets.stages]]
method = "proportional"
allocation_source = "BLS_QCEW"
geographic_scale = "state"

[[activity_sets]]
name = "mining"
names = ["Mining"]
geographic_scale = "state"

[[activity_sets.stages]]
method = "proportional"
allocation_source = "BLS_QCEW"
geographic_scale = "state"
"#;

fn employment() -> InMemorySource {
    let mut src = InMemorySource::new();
    src.insert(
        "BLS_QCEW",
        2015,
        vec![
            weight("06000", "111", 100.0, "p"),
            weight("06000", "112", 200.0, "p"),
            weight("06000", "113", 300.0, "p"),
        ],
    );
    src
}

// -------------------------------------------------------------------------
// Worked scenarios
// -------------------------------------------------------------------------

#[test]
fn parent_disaggregated_by_child_weights() {
    let plan = plan(
        r#"
name = "Water_state_2015"
target_sector_level = 3

[[activity_sets]]
name = "crops"
names = ["Crops"]
geographic_scale = "state"

[[activity_sets.stages]]
method = "disaggregation"
allocation_source = "BLS_QCEW"
geographic_scale = "state"
"#,
    );
    let parts = vec![partition(
        "crops",
        vec![primary("06000", "Crops", "11", FlowAmount::Value(900.0), "kg")],
    )];
    let result = run(&plan, &parts, &ctx(), &employment());

    assert_eq!(result.summary.failed, 0);
    assert_eq!(amount_at(&result, "06000", "111"), FlowAmount::Value(150.0));
    assert_eq!(amount_at(&result, "06000", "112"), FlowAmount::Value(300.0));
    assert_eq!(amount_at(&result, "06000", "113"), FlowAmount::Value(450.0));
    let total: f64 = result.records().filter_map(|r| r.flow_amount.value()).sum();
    assert!((total - 900.0).abs() < 1e-6);
}

#[test]
fn candidates_split_by_weight() {
    let plan = plan(STATE_PROPORTIONAL);
    let records = ["111", "112", "113"]
        .iter()
        .map(|s| primary("06000", "Crops", s, FlowAmount::Value(900.0), "kg"))
        .collect();
    let result = run(&plan, &[partition("crops", records)], &ctx(), &employment());
    assert_eq!(amount_at(&result, "06000", "111"), FlowAmount::Value(150.0));
    assert_eq!(amount_at(&result, "06000", "113"), FlowAmount::Value(450.0));
    assert!(result.summary.diagnostic_counts.is_empty());
}

#[test]
fn no_weights_splits_evenly() {
    let plan = plan(STATE_PROPORTIONAL);
    let records = vec![
        primary("06000", "Mining", "211", FlowAmount::Value(60.0), "kg"),
        primary("06000", "Mining", "212", FlowAmount::Value(60.0), "kg"),
    ];
    let result = run(&plan, &[partition("mining", records)], &ctx(), &employment());

    assert_eq!(amount_at(&result, "06000", "211"), FlowAmount::Value(30.0));
    assert_eq!(amount_at(&result, "06000", "212"), FlowAmount::Value(30.0));
    assert!(result.records().all(|r| r.provenance == Provenance::Estimated));
    assert_eq!(result.summary.diagnostic_counts.get("missing_weight_data"), Some(&1));
    assert_eq!(result.summary.degraded.len(), 1);
}

#[test]
fn direct_pushes_parent_to_children() {
    let plan = plan(
        r#"
name = "Water_national_2015"
target_sector_level = 3

[[activity_sets]]
name = "mining"
names = ["Mining"]

[[activity_sets.stages]]
method = "direct"
"#,
    );
    let parts = vec![partition(
        "mining",
        vec![primary("00000", "Mining", "21", FlowAmount::Value(60.0), "kg")],
    )];
    let result = run(&plan, &parts, &ctx(), &InMemorySource::new());
    assert_eq!(amount_at(&result, "00000", "211"), FlowAmount::Value(30.0));
    assert_eq!(amount_at(&result, "00000", "212"), FlowAmount::Value(30.0));
    assert_eq!(result.summary.diagnostic_counts.get("equal_allocation"), Some(&1));
}

const COUNTY_MULTIPLICATION: &str = r#"
name = "Emissions_county_2015"
target_sector_level = 3

[[activity_sets]]
name = "electronics"
names = ["Electronics"]
geographic_scale = "county"

[[activity_sets.stages]]
method = "multiplication"
allocation_source = "EF"
geographic_scale = "state"
"#;

#[test]
fn county_rows_take_state_rates() {
    let mut src = InMemorySource::new();
    src.insert("EF", 2015, vec![weight("06000", "334", 5.0, "kg/p")]);
    let parts = vec![partition(
        "electronics",
        vec![primary("06037", "Electronics", "334", FlowAmount::Value(10.0), "p")],
    )];
    let result = run(&plan(COUNTY_MULTIPLICATION), &parts, &ctx(), &src);

    let row = result.records().next().unwrap();
    assert_eq!(row.location, "06037");
    assert_eq!(row.flow_amount, FlowAmount::Value(50.0));
    assert_eq!(row.unit, "kg");
}

#[test]
fn county_without_state_rate_falls_back_to_national() {
    let mut src = InMemorySource::new();
    src.insert(
        "EF",
        2015,
        vec![weight("06000", "334", 5.0, "kg/p"), weight("00000", "334", 2.0, "kg/p")],
    );
    let parts = vec![partition(
        "electronics",
        vec![
            primary("06037", "Electronics", "334", FlowAmount::Value(10.0), "p"),
            primary("48201", "Electronics", "334", FlowAmount::Value(10.0), "p"),
        ],
    )];
    let result = run(&plan(COUNTY_MULTIPLICATION), &parts, &ctx(), &src);

    assert_eq!(amount_at(&result, "06037", "334"), FlowAmount::Value(50.0));
    assert_eq!(amount_at(&result, "48201", "334"), FlowAmount::Value(20.0));
    assert_eq!(result.summary.diagnostic_counts.get("national_fallback"), Some(&1));
}

#[test]
fn other_states_rates_are_never_summed_into_a_fallback() {
    let mut src = InMemorySource::new();
    src.insert(
        "EF",
        2015,
        vec![weight("08000", "334", 9.0, "kg/p"), weight("48000", "334", 3.0, "kg/p")],
    );
    let parts = vec![partition(
        "electronics",
        vec![primary("06037", "Electronics", "334", FlowAmount::Value(10.0), "p")],
    )];
    let result = run(&plan(COUNTY_MULTIPLICATION), &parts, &ctx(), &src);

    assert_eq!(result.summary.failed, 0);
    assert_eq!(result.records().count(), 0);
    assert_eq!(result.summary.diagnostic_counts.get("data_loss_on_merge"), Some(&1));
    assert_eq!(result.summary.diagnostic_counts.get("national_fallback"), None);
}

#[test]
fn suppressed_survives_proportional() {
    let plan = plan(STATE_PROPORTIONAL);
    let records = vec![
        primary("06000", "Crops", "111", FlowAmount::Suppressed, "kg"),
        primary("06000", "Crops", "112", FlowAmount::Suppressed, "kg"),
    ];
    let result = run(&plan, &[partition("crops", records)], &ctx(), &employment());

    assert_eq!(result.summary.rows_out, 2);
    assert!(result.records().all(|r| r.flow_amount == FlowAmount::Suppressed));
    assert_eq!(
        result.summary.diagnostic_counts.get("suppressed_pass_through"),
        Some(&1)
    );
}

// -------------------------------------------------------------------------
// Nested stages
// -------------------------------------------------------------------------

#[test]
fn nested_stage_builds_the_weights() {
    let plan = plan(
        r#"
name = "Water_state_2015"
target_sector_level = 3

[[activity_sets]]
name = "irrigation"
names = ["Irrigation"]
geographic_scale = "state"

[[activity_sets.stages]]
method = "proportional"
allocation_source = "USDA_CoA_Cropland"
geographic_scale = "state"

[activity_sets.stages.allocation_method]
method = "proportional"
allocation_source = "BLS_QCEW"
geographic_scale = "state"
"#,
    );

    let cropland = |sector: &str| FlowRecord {
        location: "06000".into(),
        activity_produced_by: Some("Cropland".into()),
        sector_produced_by: Some(sector.into()),
        flow_name: "AREA HARVESTED".into(),
        unit: "ACRES".into(),
        year: 2015,
        flow_amount: FlowAmount::Value(400.0),
        ..Default::default()
    };
    let mut src = InMemorySource::new();
    src.insert("USDA_CoA_Cropland", 2015, vec![cropland("111"), cropland("112")])
        .insert(
            "BLS_QCEW",
            2015,
            vec![weight("06000", "111", 1.0, "p"), weight("06000", "112", 3.0, "p")],
        );

    let records = vec![
        primary("06000", "Irrigation", "111", FlowAmount::Value(100.0), "kg"),
        primary("06000", "Irrigation", "112", FlowAmount::Value(100.0), "kg"),
    ];
    let result = run(&plan, &[partition("irrigation", records)], &ctx(), &src);

    assert_eq!(result.summary.failed, 0, "{:?}", result.summary.failures);
    assert!(close(amount_at(&result, "06000", "111"), 25.0));
    assert!(close(amount_at(&result, "06000", "112"), 75.0));
}

// -------------------------------------------------------------------------
// Pluggable functions
// -------------------------------------------------------------------------

const WEIGHTED: &str = r#"
name = "Land_national_2015"
target_sector_level = 3

[[activity_sets]]
name = "crops"
names = ["Crops"]
geographic_scale = "state"

[[activity_sets.stages]]
method = "weighted_avg"
allocation_source = "BLS_QCEW"
geographic_scale = "state"
function = "scale_by_total_weight"
"#;

#[test]
fn registered_function_runs_in_the_pipeline() {
    let mut registry = FunctionRegistry::new();
    registry.register(
        "scale_by_total_weight",
        |primary: &[FlowRecord], secondary: &SecondaryTable, _: &Stage| -> Result<Vec<FlowRecord>, AllocError> {
            let total: f64 = secondary.records.iter().filter_map(|r| r.flow_amount.value()).sum();
            Ok(primary
                .iter()
                .map(|r| FlowRecord {
                    flow_amount: r.flow_amount.scale(1.0 / total),
                    ..r.clone()
                })
                .collect())
        },
    );
    let plan = AllocationPlan::from_toml(WEIGHTED, &registry).unwrap();
    let parts = vec![partition(
        "crops",
        vec![primary("06000", "Crops", "111", FlowAmount::Value(1200.0), "kg")],
    )];
    let result = run(&plan, &parts, &ctx(), &employment());
    assert_eq!(amount_at(&result, "06000", "111"), FlowAmount::Value(2.0));
}

#[test]
fn failing_function_fails_its_partition() {
    let mut registry = FunctionRegistry::new();
    registry.register(
        "scale_by_total_weight",
        |_: &[FlowRecord], _: &SecondaryTable, _: &Stage| -> Result<Vec<FlowRecord>, AllocError> {
            Err(AllocError::ConfigValidation("no acreage column".into()))
        },
    );
    let plan = AllocationPlan::from_toml(WEIGHTED, &registry).unwrap();
    let parts = vec![partition(
        "crops",
        vec![primary("06000", "Crops", "111", FlowAmount::Value(1.0), "kg")],
    )];
    let result = run(&plan, &parts, &ctx(), &employment());
    match &result.outcomes[0].result {
        Err(AllocError::FunctionFailed { name, message }) => {
            assert_eq!(name, "scale_by_total_weight");
            assert!(message.contains("no acreage column"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// -------------------------------------------------------------------------
// Failures
// -------------------------------------------------------------------------

#[test]
fn unknown_method_fails_at_load() {
    let err = AllocationPlan::from_toml(
        r#"
name = "Bad"
[[activity_sets]]
name = "crops"
names = ["Crops"]
[[activity_sets.stages]]
method = "proportional_by_magic"
allocation_source = "BLS_QCEW"
"#,
        &FunctionRegistry::new(),
    )
    .unwrap_err();
    assert!(matches!(err, AllocError::AmbiguousAllocationMethod { .. }));
}

#[test]
fn failing_partitions_do_not_stop_the_run() {
    let plan = plan(
        r#"
name = "Water_state_2015"
target_sector_level = 3

[[activity_sets]]
name = "crops"
names = ["Crops"]
geographic_scale = "state"

[[activity_sets.stages]]
method = "proportional"
allocation_source = "BLS_QCEW"
geographic_scale = "state"

[[activity_sets]]
name = "livestock"
names = ["Livestock"]
geographic_scale = "state"

[[activity_sets.stages]]
method = "proportional"
allocation_source = "USDA_CoA_Livestock"
geographic_scale = "state"
"#,
    );
    let good = partition(
        "crops",
        vec![primary("06000", "Crops", "111", FlowAmount::Value(5.0), "kg")],
    );
    let missing_source = partition(
        "livestock",
        vec![primary("06000", "Livestock", "112", FlowAmount::Value(5.0), "kg")],
    );
    let missing_set = partition(
        "aquaculture",
        vec![primary("06000", "Aquaculture", "112", FlowAmount::Value(5.0), "kg")],
    );
    let result = run(&plan, &[good, missing_source, missing_set], &ctx(), &employment());

    assert_eq!(result.summary.partitions, 3);
    assert_eq!(result.summary.succeeded, 1);
    assert_eq!(result.summary.failed, 2);
    assert_eq!(amount_at(&result, "06000", "111"), FlowAmount::Value(5.0));

    assert!(matches!(
        result.outcomes[1].result,
        Err(AllocError::SourceLoad { .. })
    ));
    assert!(matches!(
        result.outcomes[2].result,
        Err(AllocError::ConfigValidation(_))
    ));
}

#[test]
fn summary_serializes_to_json() {
    let plan = plan(STATE_PROPORTIONAL);
    let parts = vec![
        partition(
            "mining",
            vec![
                primary("06000", "Mining", "211", FlowAmount::Value(60.0), "kg"),
                primary("06000", "Mining", "212", FlowAmount::Value(60.0), "kg"),
            ],
        ),
        partition("quarrying", Vec::new()),
    ];
    let result = run(&plan, &parts, &ctx(), &employment());

    let json: serde_json::Value =
        serde_json::from_str(&result.summary.to_json().unwrap()).unwrap();
    assert_eq!(json["partitions"], 2);
    assert_eq!(json["failed"], 1);
    assert_eq!(json["rows_in"], 2);
    assert_eq!(json["diagnostic_counts"]["missing_weight_data"], 1);
    assert_eq!(json["failures"][0]["partition"], "USGS_NWIS_WU/quarrying/2015");
    assert_eq!(result.meta.method_name, "Water_state_2015");
}

// -------------------------------------------------------------------------
// Properties
// -------------------------------------------------------------------------

fn config_64() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(64),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

proptest! {
    #![proptest_config(config_64())]

    #[test]
    fn disaggregation_conserves_the_parent(
        amount in 1.0f64..1e6,
        weights in proptest::collection::vec(1.0f64..1e4, 3),
    ) {
        let plan = plan(
            r#"
name = "Conservation"
target_sector_level = 3

[[activity_sets]]
name = "crops"
names = ["Crops"]
geographic_scale = "state"

[[activity_sets.stages]]
method = "disaggregation"
allocation_source = "BLS_QCEW"
geographic_scale = "state"
"#,
        );
        let mut src = InMemorySource::new();
        src.insert(
            "BLS_QCEW",
            2015,
            ["111", "112", "113"]
                .iter()
                .zip(&weights)
                .map(|(s, w)| weight("06000", s, *w, "p"))
                .collect(),
        );
        let parts = vec![partition(
            "crops",
            vec![primary("06000", "Crops", "11", FlowAmount::Value(amount), "kg")],
        )];
        let result = run(&plan, &parts, &ctx(), &src);

        let total: f64 = result.records().filter_map(|r| r.flow_amount.value()).sum();
        prop_assert!((total - amount).abs() <= 1e-6 * amount.max(1.0));
        prop_assert_eq!(result.summary.rows_out, 3);
    }

    #[test]
    fn even_split_gives_each_child_an_equal_share(
        amount in 1.0f64..1e6,
    ) {
        let plan = plan(STATE_PROPORTIONAL);
        let records = vec![
            primary("06000", "Mining", "211", FlowAmount::Value(amount), "kg"),
            primary("06000", "Mining", "212", FlowAmount::Value(amount), "kg"),
        ];
        let result = run(&plan, &[partition("mining", records)], &ctx(), &employment());
        prop_assert!(close(amount_at(&result, "06000", "211"), amount / 2.0));
        prop_assert!(close(amount_at(&result, "06000", "212"), amount / 2.0));
    }
}
