use chrono::{Duration, TimeZone, Utc};
use dfe_db::{ManifestationStore, QuotaStore};
use dfe_schemas::{
    AccessKey, AccountId, EventType, ManifestationRecord, QuotaWindowSnapshot, Verdict,
};
use uuid::Uuid;

const KEY: &str = "52060433009911002506550120000007800267301615";

#[tokio::test]
async fn manifestation_record_is_written_once() -> anyhow::Result<()> {
    let url = match std::env::var(dfe_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: DFE_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await?;
    dfe_db::migrate(&pool).await?;
    let repo = dfe_db::PgRepository::new(pool);

    let account = AccountId::new(format!("acct-{}", Uuid::new_v4()))?;
    let key = AccessKey::parse(KEY)?;

    assert!(repo
        .find_manifestation(&key, EventType::Awareness, &account)
        .await?
        .is_none());

    let rec = ManifestationRecord {
        access_key: key.clone(),
        event_type: EventType::Awareness,
        account_id: account.clone(),
        sequence: 1,
        event_id: format!("ID210210{KEY}01"),
        verdict: Verdict {
            status_code: 135,
            reason: "Evento registrado e vinculado a NF-e".to_string(),
            protocol: Some("891000000000001".to_string()),
        },
        signed_xml: "<evento/>".to_string(),
        registered_at_utc: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
    };

    assert!(repo.record_manifestation(&rec).await?);

    let mut second = rec.clone();
    second.verdict.protocol = Some("891000000000999".to_string());
    assert!(
        !repo.record_manifestation(&second).await?,
        "second record for the same identity must not be written"
    );

    let found = repo
        .find_manifestation(&key, EventType::Awareness, &account)
        .await?
        .expect("record");
    assert_eq!(found, rec);

    Ok(())
}

#[tokio::test]
async fn quota_reservations_share_one_window() -> anyhow::Result<()> {
    let url = match std::env::var(dfe_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: DFE_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await?;
    dfe_db::migrate(&pool).await?;
    // Two handles on one database stand in for two processes.
    let daemon = dfe_db::PgRepository::new(pool.clone());
    let cli = dfe_db::PgRepository::new(pool);

    let account = AccountId::new(format!("acct-{}", Uuid::new_v4()))?;
    assert_eq!(daemon.load_quota(&account).await?, QuotaWindowSnapshot::default());

    let window = Duration::seconds(3600);
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    assert!(daemon.reserve_quota(&account, t0, window, 3).await?.admitted);
    assert!(cli.reserve_quota(&account, t0 + Duration::seconds(10), window, 3).await?.admitted);
    let third = daemon.reserve_quota(&account, t0 + Duration::seconds(20), window, 3).await?;
    assert!(third.admitted);
    assert_eq!(third.window.requests.len(), 3);

    // The fourth is refused whichever handle asks; nothing is appended.
    let refused = cli.reserve_quota(&account, t0 + Duration::seconds(30), window, 3).await?;
    assert!(!refused.admitted);
    assert_eq!(refused.window.requests.len(), 3);

    // Once the first request ages out, one slot opens.
    let later = t0 + Duration::seconds(3600);
    let reopened = cli.reserve_quota(&account, later, window, 3).await?;
    assert!(reopened.admitted);
    assert_eq!(
        reopened.window.requests,
        vec![t0 + Duration::seconds(10), t0 + Duration::seconds(20), later]
    );

    // Suspensions never shorten and block every handle.
    let until = later + Duration::seconds(3900);
    daemon.record_suspension(&account, until).await?;
    cli.record_suspension(&account, later + Duration::seconds(60)).await?;
    assert_eq!(cli.load_quota(&account).await?.suspended_until, Some(until));

    let blocked = cli.reserve_quota(&account, later + Duration::seconds(120), window, 3).await?;
    assert!(!blocked.admitted);
    assert_eq!(blocked.window.suspended_until, Some(until));
    assert!(daemon.reserve_quota(&account, until + Duration::seconds(1), window, 3).await?.admitted);

    Ok(())
}

#[tokio::test]
async fn concurrent_reservations_never_exceed_the_limit() -> anyhow::Result<()> {
    let url = match std::env::var(dfe_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: DFE_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await?;
    dfe_db::migrate(&pool).await?;

    let account = AccountId::new(format!("acct-{}", Uuid::new_v4()))?;
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    let mut tasks = Vec::new();
    for i in 0..30i64 {
        let repo = dfe_db::PgRepository::new(pool.clone());
        let account = account.clone();
        tasks.push(tokio::spawn(async move {
            repo.reserve_quota(&account, t0 + Duration::seconds(i), Duration::seconds(3600), 20)
                .await
        }));
    }

    let mut admitted = 0;
    for t in tasks {
        if t.await??.admitted {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 20);

    let repo = dfe_db::PgRepository::new(pool);
    assert_eq!(repo.load_quota(&account).await?.requests.len(), 20);
    Ok(())
}
