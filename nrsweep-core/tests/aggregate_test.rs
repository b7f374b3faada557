//! End-to-end aggregation over stores written by `ResultStore`.

use std::fs;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use nrsweep_core::aggregate::{AggregateConfig, AggregateError, Aggregator};
use nrsweep_core::layout::ResultLayout;
use nrsweep_core::param::{ParamSpec, ParamValue, ParameterAssignment, ParameterSpace};
use nrsweep_core::store::{format_record, ResultStore};

fn stamp(minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 2, 14)
        .unwrap()
        .and_hms_opt(10, minute, 0)
        .unwrap()
}

fn space() -> ParameterSpace {
    ParameterSpace::new(vec![
        ParamSpec::int("gNbNum", &[1, 7]),
        ParamSpec::int("ueNum", &[4, 12, 20]).with_column("UeNum"),
        ParamSpec::int("dlOnly", &[0, 1]),
        ParamSpec::int("allocate", &[0, 1]),
        ParamSpec::int("scheduler", &[0, 1, 2]),
    ])
    .unwrap()
}

fn assignment(values: [i64; 5]) -> ParameterAssignment {
    let names = ["gNbNum", "ueNum", "dlOnly", "allocate", "scheduler"];
    ParameterAssignment::from_pairs(names.into_iter().zip(values.map(ParamValue::Int)))
}

/// Write `rows` through the store exactly as a sweep would.
fn write_store(path: &Path, rows: &[([i64; 5], [f64; 4])]) {
    let layout = ResultLayout::basic();
    let store = ResultStore::for_layout(path, &space(), &layout);
    store.ensure_initialized().unwrap();
    for (i, (params, values)) in rows.iter().enumerate() {
        let fields = format_record(&assignment(*params), values, &layout);
        store.append(&fields, stamp(i as u32)).unwrap();
    }
}

fn aggregator() -> Aggregator {
    Aggregator::new(ResultLayout::basic(), AggregateConfig::default())
}

#[test]
fn seven_site_rows_are_averaged_then_scaled() {
    // GIVEN: three repeats of one seven-site configuration
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sim_results.csv");
    let output = dir.path().join("processed_sim_results.csv");
    write_store(
        &input,
        &[
            ([7, 20, 1, 1, 0], [10.0, 1.0, 1.0, 0.1]),
            ([7, 20, 1, 1, 0], [20.0, 2.0, 2.0, 0.2]),
            ([7, 20, 1, 1, 0], [30.0, 3.0, 3.0, 0.3]),
        ],
    );

    // WHEN: aggregating
    let table = aggregator().run(&input, &output).unwrap();

    // THEN: one row, UeNum tripled, means rounded, codes relabeled
    assert_eq!(table.rows.len(), 1);
    assert_eq!(table.rows[0].samples, 3);
    let text = fs::read_to_string(&output).unwrap();
    assert_eq!(
        text,
        "gNbNum,UeNum,dlOnly,allocate,scheduler,Throughput,Delay,PacketLossRate,BLER\n\
         7,60,DL,USED,RR,20.000,2.000,2.000,0.200\n"
    );
}

#[test]
fn single_site_rows_keep_their_user_count() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sim_results.csv");
    let output = dir.path().join("out").join("processed.csv");
    write_store(
        &input,
        &[
            ([1, 20, 0, 1, 1], [5.0, 1.0, 0.0, 0.0]),
            ([7, 4, 1, 0, 2], [7.0, 1.0, 0.0, 0.0]),
        ],
    );

    aggregator().run(&input, &output).unwrap();

    let text = fs::read_to_string(&output).unwrap();
    let rows: Vec<&str> = text.lines().skip(1).collect();
    assert_eq!(
        rows,
        vec![
            "1,20,UL,USED,PF,5.000,1.000,0.000,0.000",
            "7,12,DL,BW,DP,7.000,1.000,0.000,0.000",
        ]
    );
}

#[test]
fn unmapped_scheduler_code_writes_nothing() {
    // GIVEN: a row whose scheduler code has no label
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sim_results.csv");
    let output = dir.path().join("processed.csv");
    write_store(&input, &[([1, 4, 1, 1, 5], [1.0, 1.0, 1.0, 1.0])]);

    // WHEN / THEN: the run fails and no output appears
    let err = aggregator().run(&input, &output).unwrap_err();
    assert!(matches!(err, AggregateError::UnmappedCode { .. }));
    assert!(!output.exists());
}

#[test]
fn legacy_literal_timestamp_rows_are_rejected() {
    // GIVEN: an old basic-variant store whose rows carry a literal `Timestamp` cell
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sim_results.csv");
    let output = dir.path().join("processed.csv");
    fs::write(
        &input,
        "gNbNum,UeNum,dlOnly,allocate,scheduler,Throughput,Delay,PacketLossRate,BLER,Timestamp\n\
         1,4,1,1,0,10.000,1.000,1.000%,0.100%,Timestamp,2025-02-14 10:00:00\n",
    )
    .unwrap();

    // WHEN / THEN: the extra cell fails the reader before any parsing
    let err = aggregator().run(&input, &output).unwrap_err();
    assert!(matches!(err, AggregateError::Csv { .. }));
    assert!(!output.exists());
}

#[test]
fn failed_run_keeps_previous_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sim_results.csv");
    let output = dir.path().join("processed.csv");
    fs::write(&output, "previous\n").unwrap();
    fs::write(
        &input,
        "gNbNum,UeNum,dlOnly,allocate,scheduler,Throughput,Delay,PacketLossRate,BLER,Timestamp\n\
         1,4,1,1,0,1.000,1.000,0.500,1.000%,2025-02-14 10:00:00\n",
    )
    .unwrap();

    let err = aggregator().run(&input, &output).unwrap_err();
    assert!(matches!(err, AggregateError::MissingPercent { line: 2, .. }));
    assert_eq!(fs::read_to_string(&output).unwrap(), "previous\n");
}

#[test]
fn aggregation_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sim_results.csv");
    write_store(
        &input,
        &[
            ([1, 12, 1, 0, 2], [3.3, 1.1, 0.5, 0.25]),
            ([1, 4, 0, 1, 0], [1.0, 2.0, 3.0, 4.0]),
            ([1, 12, 1, 0, 2], [3.4, 1.2, 0.7, 0.35]),
            ([7, 20, 1, 1, 1], [9.0, 9.0, 9.0, 9.0]),
        ],
    );

    let first = dir.path().join("a.csv");
    let second = dir.path().join("b.csv");
    aggregator().run(&input, &first).unwrap();
    aggregator().run(&input, &second).unwrap();
    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn refuses_to_overwrite_the_raw_store() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sim_results.csv");
    write_store(&input, &[([1, 4, 1, 1, 0], [1.0, 1.0, 1.0, 1.0])]);
    let before = fs::read(&input).unwrap();

    let err = aggregator().run(&input, &input).unwrap_err();
    assert!(matches!(err, AggregateError::SameFile(_)));
    assert_eq!(fs::read(&input).unwrap(), before);
}

#[test]
fn percent_values_survive_store_and_aggregation() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sim_results.csv");
    let output = dir.path().join("processed.csv");
    write_store(&input, &[([1, 4, 1, 1, 0], [0.0, 0.0, 12.345, 0.001])]);

    let raw = fs::read_to_string(&input).unwrap();
    assert!(raw.contains("12.345%,0.001%"));

    let table = aggregator().run(&input, &output).unwrap();
    assert_eq!(table.rows[0].values, vec![0.0, 0.0, 12.345, 0.001]);
}
