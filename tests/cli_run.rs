use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;

use parcor::io::{RESULTS_FILE, SUMMARY_FILE, read_results};
use tempfile::tempdir;

const N: usize = 40;

fn write_inputs(dir: &Path) {
    let mut expression = String::from("sample_id\tENSG00000091317\tSTUB1\tSQSTM1\tcohort\n");
    let mut timer = String::from("sample_id,B_cell,Macrophage,Tumor_purity\n");
    for i in 0..N {
        let t = i as f64;
        let macrophage = (t * 0.29).sin();
        let b_cell = (t * 0.53).cos();
        let purity = (t * 0.17).sin() * 0.5;
        let cmtm6 = macrophage + 0.5 * (t * 1.3).sin();
        let stub1 = macrophage - b_cell * 0.4 + 0.5 * (t * 2.1).cos();
        let sqstm1 = 0.3 * cmtm6 + purity + 0.5 * (t * 0.77).cos();
        writeln!(expression, "P{i}\t{cmtm6}\t{stub1}\t{sqstm1}\tTCGA").unwrap();
        writeln!(timer, "P{i},{b_cell},{macrophage},{purity}").unwrap();
    }
    fs::write(dir.join("expression.tsv"), expression).unwrap();
    fs::write(dir.join("timer.csv"), timer).unwrap();

    let config = r#"
trial_count = 100
random_seed = 7

[gene_aliases]
CMTM6 = "ENSG00000091317"

[[covariate_sets]]
name = "immune"
confounders = ["B_cell", "Macrophage"]

[[covariate_sets]]
name = "purity"
confounders = ["Tumor_purity"]

[[pairs]]
gene1 = "CMTM6"
gene2 = "STUB1"

[[pairs]]
gene1 = "HIP1R"
gene2 = "SQSTM1"
covariate_sets = ["purity"]
"#;
    fs::write(dir.join("parcor.toml"), config).unwrap();
}

fn parcor(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_parcor"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run parcor")
}

#[test]
fn run_writes_one_row_per_unit_and_a_summary() {
    let tmp = tempdir().unwrap();
    write_inputs(tmp.path());

    let output = parcor(
        tmp.path(),
        &[
            "run",
            "--expression",
            "expression.tsv",
            "--confounders",
            "timer.csv",
            "--config",
            "parcor.toml",
            "--out-dir",
            "out",
            "--threads",
            "2",
            "--quiet",
        ],
    );
    assert!(
        output.status.success(),
        "parcor run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let rows = read_results(&tmp.path().join("out").join(RESULTS_FILE)).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows.iter().map(|r| r.covariate_set.as_str()).collect::<Vec<_>>(),
        ["immune", "purity", "purity"]
    );
    assert!(rows[0].is_ok() && rows[1].is_ok());
    assert_eq!(rows[0].bootstrap_requested, Some(100));
    assert_eq!(rows[2].status, "skipped");
    assert_eq!(rows[2].reason_code.as_deref(), Some("MissingGene"));

    let summary: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(tmp.path().join("out").join(SUMMARY_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["aligned_samples"], N);
    assert_eq!(summary["units"], 3);
    assert_eq!(summary["completed"], 2);
    assert_eq!(summary["skipped"], 1);
    assert_eq!(summary["threads"], 2);
    assert_eq!(summary["skip_reasons"]["MissingGene"], 1);

    let compared = parcor(
        tmp.path(),
        &[
            "compare",
            "out/partial_correlation_results.tsv",
            "out/partial_correlation_results.tsv",
            "--out",
            "comparison.tsv",
        ],
    );
    assert!(compared.status.success());
    let comparison = fs::read_to_string(tmp.path().join("comparison.tsv")).unwrap();
    assert_eq!(comparison.lines().count(), 4);
}

#[test]
fn invalid_configuration_exits_with_status_one() {
    let tmp = tempdir().unwrap();
    write_inputs(tmp.path());

    let output = parcor(
        tmp.path(),
        &[
            "run",
            "--expression",
            "expression.tsv",
            "--confounders",
            "timer.csv",
            "--config",
            "parcor.toml",
            "--trials",
            "0",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("trial_count"));
}

#[test]
fn template_and_diagnose() {
    let tmp = tempdir().unwrap();
    write_inputs(tmp.path());

    let template = parcor(tmp.path(), &["template", "template.toml"]);
    assert!(template.status.success());
    let text = fs::read_to_string(tmp.path().join("template.toml")).unwrap();
    assert!(text.contains("SQSTM1"));

    let diagnose = parcor(
        tmp.path(),
        &[
            "diagnose",
            "--confounders",
            "timer.csv",
            "--config",
            "parcor.toml",
            "--out",
            "diag.json",
        ],
    );
    assert!(
        diagnose.status.success(),
        "{}",
        String::from_utf8_lossy(&diagnose.stderr)
    );
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(tmp.path().join("diag.json")).unwrap()).unwrap();
    assert_eq!(report.as_array().map(Vec::len), Some(2));
    assert_eq!(report[0]["name"], "immune");
    assert_eq!(report[0]["collinear"], false);
}
