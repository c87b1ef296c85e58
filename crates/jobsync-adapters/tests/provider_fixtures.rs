use std::path::PathBuf;

use jobsync_adapters::{load_payload, NormalizationRule, Provider1Rule, TransformDispatcher};
use jobsync_core::Provider;

fn fixture(provider: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(provider)
        .join("sample.json")
}

#[test]
fn provider1_fixture_normalizes_and_skips_the_broken_record() {
    let payload = load_payload(fixture("provider1")).expect("fixture");
    let normalized = Provider1Rule.normalize(&payload).expect("normalize");
    assert_eq!(normalized.skipped, 1);

    let jobs = normalized.jobs;
    let ids = jobs.iter().map(|j| j.external_id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["P1-118", "P1-442", "P1-733"]);

    let analyst = &jobs[1];
    assert_eq!(analyst.employment_type, "Contract");
    assert_eq!(analyst.min_salary, Some(62_000.0));
    assert_eq!(analyst.max_salary, Some(102_000.0));
    assert_eq!(analyst.skills, vec!["Python", "SQL", "Tableau"]);
    assert_eq!(analyst.experience_level, "Mid Level");

    let manager = &jobs[2];
    assert_eq!(manager.experience_level, "Manager");
    assert_eq!(manager.employment_type, "Hybrid");
    assert_eq!(manager.min_salary, None);
    assert_eq!(manager.posted_date, None);
    assert_eq!(
        manager.description,
        "Engineering Manager position at BackEnd Solutions located in New York, NY (Hybrid)."
    );
}

#[test]
fn provider2_fixture_normalizes_every_record() {
    let payload = load_payload(fixture("provider2")).expect("fixture");
    let jobs = TransformDispatcher::new()
        .transform("provider2", payload)
        .expect("known provider");
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.provider == Provider::Provider2 && j.active));

    let remote = jobs.iter().find(|j| j.external_id == "job-388").expect("job-388");
    assert_eq!(remote.location, "Seattle, WA (Remote)");
    assert_eq!(remote.employment_type, "Remote");
    assert_eq!(remote.experience_level, "Junior");
    assert_eq!((remote.min_salary, remote.max_salary), (None, None));

    let architect = jobs.iter().find(|j| j.external_id == "job-517").expect("job-517");
    assert_eq!(architect.location, "Remote");
    assert_eq!(architect.experience_level, "Principal");
    assert_eq!(architect.currency.as_deref(), Some("USD"));
    assert_eq!(architect.application_url, "");
}

#[test]
fn fixtures_are_rejected_by_the_wrong_rule() {
    let payload = load_payload(fixture("provider2")).expect("fixture");
    let jobs = TransformDispatcher::new()
        .transform("provider1", payload)
        .expect("known provider");
    assert!(jobs.is_empty());
}
