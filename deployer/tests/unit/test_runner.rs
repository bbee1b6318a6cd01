//! Runner phase tests

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::FutureExt;
use tempfile::NamedTempFile;
use tokio_test::{assert_err, assert_ok};

use fleet_api::{BUILD_ID_TAG, DEPLOY_TAG};
use fleetroll::deploy::{Job, Phase};
use fleetroll::errors::DeployError;

use crate::support::{
    database_file, deploy_file, host, migrating_file, registry_from, runner, with_app,
    FakeProvider, FakeTransport, BUILD,
};

fn previous_fleet(provider: &FakeProvider, count: usize) {
    provider.add_group("web-group-111", "app", "111", count as u32);
    for n in 0..count {
        provider.add_instance("web-group-111", &format!("i-{}", n));
    }
}

#[tokio::test]
async fn test_stop_app_retries_only_failures() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    previous_fleet(&provider, 5);
    transport.state().exit_codes.insert(host("i-3"), 1);

    let mut runner = runner(registry_from(deploy_file()), &provider, &transport);
    let err = runner
        .with_deploy("app", |r| Box::pin(r.stop_app()))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::PartialFailure(_)));
    assert_eq!(err.to_string(), "Partial failure: Failed to stop app on 1 instances");

    let state = transport.state();
    assert_eq!(state.execs_on(&host("i-3"), "sudo stop app"), 3);
    for ok in ["i-0", "i-1", "i-2", "i-4"] {
        assert_eq!(state.execs_on(&host(ok), "sudo stop app"), 1);
    }
}

#[tokio::test]
async fn test_stop_app_can_continue_on_failure() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    previous_fleet(&provider, 5);
    transport.state().unreachable.insert(host("i-0"));

    let file = with_app(|app| app["continue_if_stop_app_fails"] = true.into());
    let mut runner = runner(registry_from(file), &provider, &transport);
    assert_ok!(runner.with_deploy("app", |r| Box::pin(r.stop_app())).await);
}

#[tokio::test]
async fn test_stop_app_without_command_is_skipped() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    previous_fleet(&provider, 2);

    let file = with_app(|app| {
        app.as_object_mut().unwrap().remove("stop_command");
    });
    let mut runner = runner(registry_from(file), &provider, &transport);
    runner
        .with_deploy("app", |r| Box::pin(r.stop_app()))
        .await
        .unwrap();
    assert!(transport.state().exec_log.is_empty());
}

#[tokio::test]
async fn test_with_deploy_unknown_name() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let mut runner = runner(registry_from(deploy_file()), &provider, &transport);

    let err = runner
        .with_deploy("missing", |r| Box::pin(r.stop_app()))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
}

#[tokio::test]
async fn test_with_deploy_restores_previous_deploy() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let mut runner = runner(registry_from(deploy_file()), &provider, &transport);

    let names = runner
        .with_deploy("app", |r| {
            Box::pin(async move {
                let inner = r
                    .with_deploy("worker", |r| {
                        Box::pin(async move { Ok(r.active_deploy().unwrap().name.clone()) })
                    })
                    .await?;
                let failed = r
                    .with_deploy("worker", |_| {
                        Box::pin(async move { Err::<(), _>(DeployError::Internal("boom".into())) })
                    })
                    .await;
                assert!(failed.is_err());
                Ok((inner, r.active_deploy().unwrap().name.clone()))
            })
        })
        .await
        .unwrap();

    assert_eq!(names, ("worker".to_string(), "app".to_string()));
    assert!(runner.active_deploy().is_none());
}

#[tokio::test]
async fn test_with_deploy_restores_on_cancellation() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let mut runner = runner(registry_from(deploy_file()), &provider, &transport);

    let pending = runner
        .with_deploy("app", |_| {
            Box::pin(async move {
                futures::future::pending::<()>().await;
                Ok(())
            })
        })
        .now_or_never();
    assert!(pending.is_none());
    assert!(runner.active_deploy().is_none());
}

#[tokio::test]
async fn test_phase_without_active_deploy_fails() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let runner = runner(registry_from(deploy_file()), &provider, &transport);
    assert_err!(runner.stop_app().await);
}

#[tokio::test]
async fn test_provision_is_idempotent() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let mut runner = runner(registry_from(deploy_file()), &provider, &transport);

    for _ in 0..2 {
        runner
            .with_deploy("app", |r| Box::pin(r.create_fleet_group()))
            .await
            .unwrap();
    }

    let state = provider.state();
    assert_eq!(state.created_templates.len(), 1);
    assert_eq!(state.created_groups.len(), 1);

    let template = &state.created_templates[0];
    assert_eq!(template.name, "web-lt-abc");
    assert!(template.monitoring);
    let user_data = BASE64.decode(template.user_data.as_deref().unwrap()).unwrap();
    assert_eq!(String::from_utf8(user_data).unwrap(), "#!/bin/sh\necho booted");

    let group = &state.created_groups[0];
    assert_eq!(group.name, "web-group-abc");
    assert_eq!(group.launch_template, "web-lt-abc");
    assert_eq!(group.tags.get(DEPLOY_TAG).map(String::as_str), Some("app"));
    assert_eq!(group.tags.get(BUILD_ID_TAG).map(String::as_str), Some(BUILD));
}

#[tokio::test]
async fn test_namespace_prefixes_names_and_tag() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let mut file = deploy_file();
    file["namespace"] = "staging".into();
    let mut runner = runner(registry_from(file), &provider, &transport);

    runner
        .with_deploy("app", |r| Box::pin(r.create_fleet_group()))
        .await
        .unwrap();

    let state = provider.state();
    let group = &state.created_groups[0];
    assert_eq!(group.name, "staging-web-group-abc");
    assert_eq!(group.launch_template, "staging-web-lt-abc");
    assert_eq!(group.tags.get(DEPLOY_TAG).map(String::as_str), Some("staging-app"));
}

#[tokio::test(start_paused = true)]
async fn test_destroy_old_groups() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    provider.state().page_size = 1;
    provider.add_group("web-group-abc", "app", BUILD, 2);
    provider.add_group("web-group-111", "app", "111", 2);
    provider.add_group("web-group-222", "app", "222", 2);
    provider.add_group("other-abc", "other", BUILD, 1);

    let mut runner = runner(registry_from(deploy_file()), &provider, &transport);
    runner
        .with_deploy("app", |r| Box::pin(r.destroy_old_groups()))
        .await
        .unwrap();

    let state = provider.state();
    assert_eq!(
        state.deleted_groups,
        vec![
            ("web-group-111".to_string(), true),
            ("web-group-222".to_string(), true)
        ]
    );
    assert_eq!(
        state.deleted_templates,
        vec!["web-group-111-lt".to_string(), "web-group-222-lt".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_destroy_new_groups_tolerates_template_failure() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    provider.add_group("web-group-abc", "app", BUILD, 2);
    provider.add_group("web-group-111", "app", "111", 2);
    provider.state().fail_template_delete = true;

    let mut runner = runner(registry_from(deploy_file()), &provider, &transport);
    runner
        .with_deploy("app", |r| Box::pin(r.destroy_new_groups()))
        .await
        .unwrap();

    let state = provider.state();
    assert_eq!(state.deleted_groups, vec![("web-group-abc".to_string(), true)]);
    assert!(state.deleted_templates.is_empty());
}

#[tokio::test]
async fn test_failed_phase_is_named() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let file = with_app(|app| app["post_deploy_command"] = "exit 3".into());
    let mut runner = runner(registry_from(file), &provider, &transport);

    let err = runner
        .with_deploy("app", |r| Box::pin(r.run_job(Job::PostDeploy)))
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("phase post_deploy failed:"));
    match err {
        DeployError::Phase { phase, .. } => assert_eq!(phase, Phase::PostDeploy.to_string()),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_post_deploy_sees_environment() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let file = with_app(|app| {
        app["post_deploy_command"] = "test \"$DEPLOY_ENV\" = production".into()
    });
    let mut runner = runner(registry_from(file), &provider, &transport);
    runner
        .with_deploy("app", |r| Box::pin(r.run_post_deploy()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_deploy_role_is_assumed() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let mut runner = runner(registry_from(deploy_file()), &provider, &transport);

    runner
        .with_deploy("worker", |r| Box::pin(r.run_job(Job::CreateGroup)))
        .await
        .unwrap();

    let state = provider.state();
    assert_eq!(state.assumed_roles, vec!["arn:aws:iam::1:role/worker".to_string()]);
    assert_eq!(
        state.created_with,
        vec![(
            "worker-group-abc".to_string(),
            Some("arn:aws:iam::1:role/worker".to_string())
        )]
    );
}

#[tokio::test]
async fn test_env_runs_every_deploy() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let runner = runner(registry_from(deploy_file()), &provider, &transport);

    assert_ok!(runner.deploy_env("production", Job::CreateGroup).await);

    let state = provider.state();
    assert_eq!(state.assumed_roles[0], "arn:aws:iam::1:role/deployer");
    let mut names: Vec<&str> = state.created_groups.iter().map(|g| g.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["web-group-abc", "worker-group-abc"]);

    drop(state);
    let err = runner.deploy_env("qa", Job::All).await.unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
}

#[tokio::test]
async fn test_env_deploys_keep_their_own_credentials() {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let runner = runner(registry_from(deploy_file()), &provider, &transport);

    assert_ok!(runner.deploy_env("production", Job::CreateGroup).await);

    let mut created = provider.state().created_with.clone();
    created.sort();
    assert_eq!(
        created,
        vec![
            (
                "web-group-abc".to_string(),
                Some("arn:aws:iam::1:role/deployer".to_string())
            ),
            (
                "worker-group-abc".to_string(),
                Some("arn:aws:iam::1:role/worker".to_string())
            ),
        ]
    );
}

/// One old instance to stop and two new ones that are healthy right away
fn replacement_fleet(
    provider: &FakeProvider,
    transport: &FakeTransport,
    db: &NamedTempFile,
    migration: &str,
) -> serde_json::Value {
    previous_fleet(provider, 1);
    for id in ["i-a", "i-b"] {
        provider.add_instance("web-group-abc", id);
        transport.healthy_after(id, Duration::ZERO);
    }
    let mut file = migrating_file(db, migration);
    file["deploys"]["app"]["sleep_before_termination_secs"] = 0.into();
    file
}

fn first_event(transport: &FakeTransport, prefix: &str) -> Option<usize> {
    transport
        .state()
        .events
        .iter()
        .position(|e| e.starts_with(prefix))
}

async fn run_full_job(job: Job) {
    let provider = FakeProvider::new();
    let transport = FakeTransport::new();
    let db = database_file();
    let file = replacement_fleet(&provider, &transport, &db, "exit 0");

    let mut runner = runner(registry_from(file), &provider, &transport);
    assert_ok!(
        runner
            .with_deploy("app", move |r| Box::pin(r.run_job(job)))
            .await
    );

    // the tunnel is closed and the group exists before the first health check
    let closed = first_event(&transport, "close_forward").unwrap();
    let probed = first_event(&transport, "exec wget").unwrap();
    assert!(closed < probed);

    {
        let state = provider.state();
        let created: Vec<&str> = state.created_groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(created, vec!["web-group-abc"]);
        assert_eq!(state.deleted_groups, vec![("web-group-111".to_string(), true)]);
        assert_eq!(state.deleted_templates, vec!["web-group-111-lt".to_string()]);
    }

    let state = transport.state();
    assert_eq!(state.forwards.len(), 1);
    assert_eq!(state.closed_forwards, state.forwards);
    assert_eq!(state.execs_on(&host("i-0"), "sudo stop app"), 1);
    assert_eq!(state.streams_open, 0);
    assert!(runner.tailer().is_empty());
}

#[tokio::test]
async fn test_full_job_runs_every_phase_in_order() {
    run_full_job(Job::All).await;
}

#[tokio::test]
async fn test_concurrent_prep_finishes_before_wait() {
    run_full_job(Job::AllAsync).await;
}

#[tokio::test]
async fn test_failed_migration_stops_full_job() {
    for job in [Job::All, Job::AllAsync] {
        let provider = FakeProvider::new();
        let transport = FakeTransport::new();
        let db = database_file();
        let file = replacement_fleet(&provider, &transport, &db, "exit 1");

        let mut runner = runner(registry_from(file), &provider, &transport);
        let err = runner
            .with_deploy("app", move |r| Box::pin(r.run_job(job)))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "phase migrate failed: migration failed: 1");
        assert!(matches!(err.root(), DeployError::MigrationError(_)));

        // nothing after the prep step ran
        assert_eq!(first_event(&transport, "exec wget"), None);
        assert_eq!(first_event(&transport, "exec sudo stop app"), None);
        assert!(provider.state().deleted_groups.is_empty());
        if job == Job::All {
            assert!(provider.state().created_groups.is_empty());
        }
    }
}
