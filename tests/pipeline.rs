// End-to-end reconciliation run over a small on-disk data directory

use assistance_recon::{
    FileOutcome, OtherProgramKind, ReconciliationRun, Resolver, RunConfig,
};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn seed_data_dir(root: &Path) {
    write(
        root,
        "extracted/organizations.json",
        r#"[
            {"orgKey": 100, "name": "DEPARTMENT OF AGRICULTURE", "agencyName": "AGRICULTURE, DEPARTMENT OF", "l1OrgKey": 100},
            {"orgKey": "110", "name": "FOREST SERVICE", "l1OrgKey": 100, "l2OrgKey": 110},
            {"orgKey": 900, "name": "ORPHANED OFFICE", "l1OrgKey": 999}
        ]"#,
    );

    write(
        root,
        "extracted/dictionary.json",
        r#"{"_embedded": {"jSONObjectList": [
            {"id": "assistance_type", "elements": [
                {"element_id": "0001", "value": "Formula Grants", "elements": [
                    {"element_id": "0001001", "value": "Formula Grants (Apportioned)"}
                ]}
            ]},
            {"id": "applicant_types", "elements": [{"element_id": "11", "value": "State"}]},
            {"id": "beneficiary_types", "elements": [{"element_id": "21", "value": "Individual"}]},
            {"id": "functional_codes", "elements": [{"element_id": "X", "value": "Ignored"}]}
        ]}}"#,
    );

    write(
        root,
        "extracted/assistance-listings.json",
        r#"[
            {"id": "abc123", "data": {
                "programNumber": "10.001",
                "title": "Agricultural  Research",
                "organizationId": "100",
                "financial": {"obligations": [
                    {"assistanceType": "0001", "values": [
                        {"year": 2023, "actual": null, "estimate": 150000},
                        {"year": 2024, "estimate": 200000}
                    ]}
                ]},
                "eligibility": {
                    "applicant": {"types": ["11"]},
                    "beneficiary": {"types": ["21"]}
                }
            }},
            {"id": "def456", "data": {
                "programNumber": "10.002",
                "title": "Program Without Agency",
                "organizationId": "555"
            }}
        ]"#,
    );

    write(
        root,
        "extracted/usaspending-program-search-hashes.json",
        r#"{"10.001": "hash-10-001"}"#,
    );

    write(
        root,
        "source/program-to-function-sub-function.csv",
        "program_id,function,sub_function\n10.001,Agriculture,Research and Education\n",
    );

    write(
        root,
        "extracted/usaspending/assistance/initial/part-1.csv",
        "assistance_transaction_unique_key,assistance_award_unique_key,federal_action_obligation,\
total_outlayed_amount_for_overall_award,action_date_fiscal_year,\
prime_award_transaction_place_of_performance_cd_current,cfda_number,assistance_type_code\n\
trans123,award123,100000,80000,2023,CA01,10.001,02\n\
trans200,award200,5000,1000,2023,CA02,10.001,02\n",
    );

    write(
        root,
        "extracted/usaspending/assistance/delta/delta-1.csv",
        "assistance_transaction_unique_key,assistance_award_unique_key,federal_action_obligation,\
total_outlayed_amount_for_overall_award,action_date_fiscal_year,\
prime_award_transaction_place_of_performance_cd_current,cfda_number,assistance_type_code,correction_delete_ind\n\
trans200,award200,,,2023,CA02,10.001,02,D\n\
trans300,award300,2500,0,2024,CA01,10.001,02,C\n",
    );

    write(
        root,
        "extracted/usaspending/contract/initial/part-1.csv",
        "contract_transaction_unique_key,contract_award_unique_key,federal_action_obligation,\
total_outlayed_amount_for_overall_award,action_date_fiscal_year,funding_office_code,funding_office_name,award_type_code\n\
c1,ca1,7000,7000,2023,OFF1,Office One,A\n\
c2,ca2,300,300,2023,OFF2,Office Two,A\n",
    );

    write(
        root,
        "source/additional-programs.csv",
        "id,name,type,agency,subagency,category,subcategory,description,assistance_type,2023_outlays,2023_foregone_revenue\n\
TX001,Mortgage Interest Deduction,tax_expenditure,Department of the Treasury,,Housing,Homeownership,Deduction,,$0,\"$25,000,000\"\n\
I001,Student Loan Interest,interest,Department of Education,,Education,,Interest subsidy,,\"$5,000,000\",\n",
    );

    write(
        root,
        "source/improper-payment-program-mapping.csv",
        "program_id,improper_payment_program_name,outlays,improper_payment_amount,insufficient_documentation_amount,high_priority_program\n\
10.001,Program A,\"$1,000,000\",\"$50,000\",\"$10,000\",1\n\
99.999,Ghost Program,$10,$1,$0,0\n",
    );
}

fn config_for(root: &Path) -> RunConfig {
    RunConfig {
        data_dir: root.to_path_buf(),
        fiscal_years: vec!["2023".to_string(), "2024".to_string()],
        contract_office_programs: HashMap::from([("OFF1".to_string(), "10.001".to_string())]),
        ..RunConfig::default()
    }
}

#[test]
fn test_full_run_reconciles_sources() {
    let dir = tempfile::tempdir().unwrap();
    seed_data_dir(dir.path());

    let mut run = ReconciliationRun::open(config_for(dir.path())).unwrap();
    let summary = run.execute().unwrap();

    assert!(summary.is_clean(), "failures: {:?}", summary.failures);
    assert_eq!(summary.agencies.inserted, 2);
    assert_eq!(summary.agencies.skipped, 1);
    assert_eq!(summary.programs.inserted, 1);
    assert_eq!(summary.programs.skipped, 1);
    assert_eq!(summary.staging.len(), 3);
    assert!(summary
        .staging
        .iter()
        .all(|f| f.outcome == FileOutcome::Committed));
    assert_eq!(summary.additional_programs.as_ref().unwrap().inserted, 2);
    let improper = summary.improper_payments.as_ref().unwrap();
    assert_eq!(improper.inserted, 1);
    assert_eq!(improper.skipped, 1);

    assert_eq!(summary.obligation_totals.len(), 2);
    assert_eq!(summary.obligation_totals["2023"], 100000.0);
    assert_eq!(summary.obligation_totals["2024"], 2500.0);

    let resolver = Resolver::new(run.store());

    // Registry has only an estimate for 2023; the aggregate carries the actual
    let obligations = resolver
        .assistance_program_obligations("10.001", &["2023", "2024"])
        .unwrap();
    assert_eq!(obligations[0].x, "2023");
    assert_eq!(obligations[0].sam_actual, None);
    assert_eq!(obligations[0].usa_spending_actual, Some(100000.0));
    assert_eq!(obligations[1].usa_spending_actual, Some(2500.0));

    let (by_program, total) = resolver
        .assistance_listing_obligations(&["10.001"], "2023")
        .unwrap();
    assert_eq!(by_program.get("10.001"), Some(&100000.0));
    assert_eq!(total, 100000.0);

    let outlays = resolver.outlays_data("10.001", &["2023"]).unwrap();
    assert_eq!(outlays.len(), 1);
    assert_eq!(outlays[0].outlay, 80000.0);
    assert_eq!(outlays[0].obligation, 100000.0);

    let contracts = resolver
        .contract_program_obligations("10.001", &["2023"])
        .unwrap();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0].total_obligations, 7000.0);

    let tax = resolver
        .other_program_obligations("TX001", &["2023"], OtherProgramKind::TaxExpenditure)
        .unwrap();
    assert_eq!(tax[0].outlays(), 0.0);
    let tax_json = serde_json::to_value(&tax[0]).unwrap();
    assert_eq!(tax_json["forgone_revenue"], 25000000.0);

    let interest = resolver
        .other_program_obligations("I001", &["2023"], OtherProgramKind::Interest)
        .unwrap();
    let interest_json = serde_json::to_value(&interest[0]).unwrap();
    assert_eq!(interest_json["outlays"], 5000000.0);
    assert!(interest_json.get("forgone_revenue").is_none());

    let info = assistance_recon::views::improper_payment_info(run.store().conn(), "10.001").unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].improper_payments, Some(50000.0));

    let tree = assistance_recon::views::category_hierarchy(run.store().conn()).unwrap();
    let titles: Vec<&str> = tree.iter().map(|n| n.title.as_str()).collect();
    assert_eq!(titles, vec!["Agriculture", "Education", "Housing"]);

    println!("✅ Full reconciliation run test PASSED");
}

#[test]
fn test_rerun_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    seed_data_dir(dir.path());

    let first = ReconciliationRun::open(config_for(dir.path()))
        .unwrap()
        .execute()
        .unwrap();
    let second = ReconciliationRun::open(config_for(dir.path()))
        .unwrap()
        .execute()
        .unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert!(first.aggregate_fingerprint.is_some());
    assert_eq!(first.aggregate_fingerprint, second.aggregate_fingerprint);
    assert_eq!(first.programs.inserted, second.programs.inserted);
    assert_eq!(first.programs.facts, second.programs.facts);
    // Curated spending rows are cleared with their programs, then reloaded
    assert_eq!(second.programs.orphans_pruned, 2);
    assert_eq!(first.additional_programs, second.additional_programs);

    let run = ReconciliationRun::open(config_for(dir.path())).unwrap();
    assert_eq!(run.store().count_rows("program").unwrap(), 3);
    assert_eq!(run.store().count_rows("usaspending_assistance").unwrap(), 2);
}

#[test]
fn test_missing_optional_inputs_leave_run_clean() {
    let dir = tempfile::tempdir().unwrap();
    seed_data_dir(dir.path());
    fs::remove_file(dir.path().join("source/additional-programs.csv")).unwrap();
    fs::remove_file(dir.path().join("source/improper-payment-program-mapping.csv")).unwrap();
    fs::remove_dir_all(dir.path().join("extracted/usaspending/contract")).unwrap();

    let mut run = ReconciliationRun::open(config_for(dir.path())).unwrap();
    let summary = run.execute().unwrap();

    assert!(summary.is_clean());
    assert!(summary.additional_programs.is_none());
    assert!(summary.improper_payments.is_none());
    assert_eq!(run.store().count_rows("improper_payment_mapping").unwrap(), 0);
    let contracts = Resolver::new(run.store())
        .contract_program_obligations("10.001", &["2023"])
        .unwrap();
    assert!(contracts.is_empty());
}

#[test]
fn test_emptied_curated_files_clear_their_tables() {
    let dir = tempfile::tempdir().unwrap();
    seed_data_dir(dir.path());
    ReconciliationRun::open(config_for(dir.path()))
        .unwrap()
        .execute()
        .unwrap();

    write(
        dir.path(),
        "source/additional-programs.csv",
        "id,name,type,agency,2023_outlays,2023_foregone_revenue\n",
    );
    write(
        dir.path(),
        "source/improper-payment-program-mapping.csv",
        "program_id,improper_payment_program_name,outlays\n",
    );

    let mut run = ReconciliationRun::open(config_for(dir.path())).unwrap();
    let summary = run.execute().unwrap();

    assert!(summary.is_clean());
    assert_eq!(run.store().count_rows("program").unwrap(), 1);
    assert_eq!(run.store().count_rows("other_program_spending").unwrap(), 0);
    assert_eq!(run.store().count_rows("improper_payment_mapping").unwrap(), 0);
    let tax = Resolver::new(run.store())
        .other_program_obligations("TX001", &["2023"], OtherProgramKind::TaxExpenditure)
        .unwrap();
    assert!(tax.is_empty());
}
