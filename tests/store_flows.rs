use annsampark::db::{self, models::*, DonationFilter, DonationUpdate, NewDonation, NewNotification, NewUser};
use annsampark::geo::Coordinates;
use chrono::{Duration, Utc};

async fn pool() -> db::DbPool {
    db::init_pool(db::MEMORY_PATH).await.expect("init pool")
}

async fn user(pool: &db::DbPool, email: &str, role: Role) -> User {
    db::create_user(
        pool,
        NewUser {
            email: email.to_string(),
            password_hash: "not-a-real-hash".to_string(),
            full_name: format!("{} user", role),
            role,
            organization_name: None,
            phone: None,
            address: None,
        },
        Utc::now(),
    )
    .await
    .expect("create user")
    .expect("fresh email")
}

fn rice(quantity: i64) -> NewDonation {
    NewDonation {
        kind: DonationKind::Food,
        item_name: "Rice bags".to_string(),
        quantity,
        description: Some("5kg each".to_string()),
        images: vec!["https://cdn.example.org/rice.jpg".to_string()],
        location: Location {
            address: "Andheri, Mumbai".to_string(),
            coordinates: Coordinates::new(19.1136, 72.8697),
        },
        expiry_time: Some(Utc::now() + Duration::hours(6)),
    }
}

#[tokio::test]
async fn duplicate_email_is_refused() {
    let pool = pool().await;
    user(&pool, "Asha@Example.org", Role::Donor).await;

    let again = db::create_user(
        &pool,
        NewUser {
            email: "asha@example.org".to_string(),
            password_hash: "x".to_string(),
            full_name: "Other".to_string(),
            role: Role::Receiver,
            organization_name: None,
            phone: None,
            address: None,
        },
        Utc::now(),
    )
    .await
    .expect("query");
    assert!(again.is_none());

    let found = db::find_user_by_email(&pool, "ASHA@example.org").await.expect("query");
    assert_eq!(found.map(|u| u.role), Some(Role::Donor));
}

#[tokio::test]
async fn created_donation_is_listed() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;

    let created = db::create_donation(&pool, &donor.id, rice(4), Utc::now()).await.expect("create");
    assert_eq!(created.status, DonationStatus::Available);
    assert_eq!(created.images, vec!["https://cdn.example.org/rice.jpg".to_string()]);

    let available = db::list_donations(
        &pool,
        DonationFilter {
            kind: Some(DonationKind::Food),
            status: Some(DonationStatus::Available),
        },
    )
    .await
    .expect("list");
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].id, created.id);

    let books = db::list_donations(
        &pool,
        DonationFilter {
            kind: Some(DonationKind::Books),
            status: None,
        },
    )
    .await
    .expect("list");
    assert!(books.is_empty());
}

/// A file-backed pool so claims really run on separate connections.
struct ScratchDb {
    path: std::path::PathBuf,
}

impl ScratchDb {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("annsampark-{}.db", uuid::Uuid::new_v4()));
        Self { path }
    }

    async fn pool(&self) -> db::DbPool {
        db::init_pool(self.path.to_str().expect("utf-8 temp path")).await.expect("init pool")
    }
}

impl Drop for ScratchDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_concurrent_claim_wins() {
    let scratch = ScratchDb::new();
    let pool = scratch.pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;
    let mut receivers = Vec::new();
    for i in 0..8 {
        receivers.push(user(&pool, &format!("ngo{i}@example.org"), Role::Receiver).await);
    }
    let donation = db::create_donation(&pool, &donor.id, rice(2), Utc::now()).await.expect("create");

    let start = std::sync::Arc::new(tokio::sync::Barrier::new(receivers.len()));
    let mut claims = tokio::task::JoinSet::new();
    for receiver in &receivers {
        let (pool, start) = (pool.clone(), start.clone());
        let (donation_id, receiver_id) = (donation.id.clone(), receiver.id.clone());
        claims.spawn(async move {
            start.wait().await;
            let won = db::claim_donation(&pool, &donation_id, &receiver_id, Utc::now()).await.expect("claim");
            (receiver_id, won)
        });
    }

    let mut winners = Vec::new();
    while let Some(joined) = claims.join_next().await {
        let (receiver_id, won) = joined.expect("claim task");
        if won {
            winners.push(receiver_id);
        }
    }
    assert_eq!(winners.len(), 1, "exactly one claim must succeed");

    let stored = db::get_donation(&pool, &donation.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, DonationStatus::Claimed);
    assert_eq!(stored.claimed_by.as_ref(), Some(&winners[0]));
    assert!(stored.claimed_at.is_some());
}

#[tokio::test]
async fn completion_credits_impact_score() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;
    let receiver = user(&pool, "ngo@example.org", Role::Receiver).await;
    let donation = db::create_donation(&pool, &donor.id, rice(7), Utc::now()).await.expect("create");

    // Cannot complete before it is claimed.
    assert!(db::complete_donation(&pool, &donation.id, Utc::now()).await.expect("complete").is_none());

    assert!(db::claim_donation(&pool, &donation.id, &receiver.id, Utc::now()).await.expect("claim"));
    assert!(db::transition_donation(&pool, &donation.id, DonationStatus::InTransit, Utc::now())
        .await
        .expect("pickup"));

    let completed = db::complete_donation(&pool, &donation.id, Utc::now())
        .await
        .expect("complete")
        .expect("was in transit");
    assert_eq!(completed.status, DonationStatus::Completed);
    assert!(completed.completed_at.is_some());

    let donor_after = db::get_user(&pool, &donor.id).await.expect("get").expect("exists");
    assert_eq!(donor_after.impact_score, 7);

    // Completing twice does not credit twice.
    assert!(db::complete_donation(&pool, &donation.id, Utc::now()).await.expect("complete").is_none());
    let stats = db::donor_stats(&pool, &donor.id).await.expect("stats");
    assert_eq!(stats.impact_score, 7);
    assert_eq!(stats.completed_donations, 1);
    assert_eq!(stats.total_items, 7);
    assert_eq!(stats.active_donations, 0);

    let received = db::receiver_stats(&pool, &receiver.id).await.expect("stats");
    assert_eq!(received.claimed_donations, 1);
    assert_eq!(received.completed_received, 1);
}

#[tokio::test]
async fn impact_score_saturates_instead_of_overflowing() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;
    let receiver = user(&pool, "ngo@example.org", Role::Receiver).await;
    let donation = db::create_donation(&pool, &donor.id, rice(7), Utc::now()).await.expect("create");

    let donor_id = donor.id.clone();
    db::with_conn(&pool, move |conn| {
        conn.execute(
            "UPDATE users SET impact_score = ?2 WHERE id = ?1",
            rusqlite::params![donor_id, i64::MAX - 3],
        )?;
        Ok(())
    })
    .await
    .expect("seed score");

    assert!(db::claim_donation(&pool, &donation.id, &receiver.id, Utc::now()).await.expect("claim"));
    assert!(db::transition_donation(&pool, &donation.id, DonationStatus::InTransit, Utc::now())
        .await
        .expect("pickup"));
    db::complete_donation(&pool, &donation.id, Utc::now())
        .await
        .expect("complete")
        .expect("was in transit");

    let donor_after = db::get_user(&pool, &donor.id).await.expect("donor still readable").expect("exists");
    assert_eq!(donor_after.impact_score, i64::MAX);
    assert_eq!(db::donor_stats(&pool, &donor.id).await.expect("stats").impact_score, i64::MAX);
}

#[tokio::test]
async fn quantity_must_stay_in_range() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;

    assert!(db::create_donation(&pool, &donor.id, rice(0), Utc::now()).await.is_err());
    assert!(db::create_donation(&pool, &donor.id, rice(db::MAX_QUANTITY + 1), Utc::now()).await.is_err());
    let largest = db::create_donation(&pool, &donor.id, rice(db::MAX_QUANTITY), Utc::now()).await.expect("create");

    let oversized = DonationUpdate {
        quantity: Some(i64::MAX),
        ..Default::default()
    };
    assert!(db::update_donation(&pool, &donor.id, &largest.id, oversized, Utc::now()).await.is_err());
    let stored = db::get_donation(&pool, &largest.id).await.expect("get").expect("exists");
    assert_eq!(stored.quantity, db::MAX_QUANTITY);
}

#[tokio::test]
async fn transitions_respect_the_lifecycle() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;
    let donation = db::create_donation(&pool, &donor.id, rice(1), Utc::now()).await.expect("create");

    // available -> in-transit skips the claim.
    assert!(!db::transition_donation(&pool, &donation.id, DonationStatus::InTransit, Utc::now())
        .await
        .expect("transition"));
    assert!(db::transition_donation(&pool, &donation.id, DonationStatus::Cancelled, Utc::now())
        .await
        .expect("cancel"));
    // Cancelled is terminal.
    assert!(!db::transition_donation(&pool, &donation.id, DonationStatus::Cancelled, Utc::now())
        .await
        .expect("transition"));
    assert!(db::transition_donation(&pool, &donation.id, DonationStatus::Completed, Utc::now())
        .await
        .is_err());
}

#[tokio::test]
async fn edits_stop_once_claimed() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;
    let receiver = user(&pool, "ngo@example.org", Role::Receiver).await;
    let donation = db::create_donation(&pool, &donor.id, rice(3), Utc::now()).await.expect("create");

    let update = DonationUpdate {
        quantity: Some(5),
        ..Default::default()
    };
    let updated = db::update_donation(&pool, &donor.id, &donation.id, update.clone(), Utc::now())
        .await
        .expect("update")
        .expect("still available");
    assert_eq!(updated.quantity, 5);
    assert_eq!(updated.item_name, "Rice bags");

    // Someone else's donation.
    assert!(db::update_donation(&pool, &receiver.id, &donation.id, update.clone(), Utc::now())
        .await
        .expect("update")
        .is_none());

    assert!(db::claim_donation(&pool, &donation.id, &receiver.id, Utc::now()).await.expect("claim"));
    assert!(db::update_donation(&pool, &donor.id, &donation.id, update, Utc::now())
        .await
        .expect("update")
        .is_none());
}

#[tokio::test]
async fn accepting_a_request_claims_and_rejects_the_rest() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;
    let chosen = user(&pool, "chosen@example.org", Role::Receiver).await;
    let other = user(&pool, "other@example.org", Role::Receiver).await;
    let donation = db::create_donation(&pool, &donor.id, rice(2), Utc::now()).await.expect("create");

    let request = db::create_request(&pool, &chosen.id, &donation.id, Some("For our shelter".into()), Utc::now())
        .await
        .expect("create")
        .expect("first request");
    let competing = db::create_request(&pool, &other.id, &donation.id, None, Utc::now())
        .await
        .expect("create")
        .expect("first request");
    assert!(db::create_request(&pool, &other.id, &donation.id, None, Utc::now())
        .await
        .expect("create")
        .is_none());

    match db::accept_request(&pool, &request.id, Utc::now()).await.expect("accept") {
        db::AcceptOutcome::Accepted {
            request,
            rejected_receivers,
        } => {
            assert_eq!(request.status, RequestStatus::Accepted);
            assert_eq!(rejected_receivers, vec![other.id.clone()]);
        }
        outcome => panic!("unexpected outcome {outcome:?}"),
    }

    let stored = db::get_donation(&pool, &donation.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, DonationStatus::Claimed);
    assert_eq!(stored.claimed_by.as_deref(), Some(chosen.id.as_str()));

    let competing = db::get_request(&pool, &competing.id).await.expect("get").expect("exists");
    assert_eq!(competing.status, RequestStatus::Rejected);

    assert!(matches!(
        db::accept_request(&pool, &request.id, Utc::now()).await.expect("accept"),
        db::AcceptOutcome::NotPending
    ));
}

#[tokio::test]
async fn direct_claim_closes_pending_requests() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;
    let asker = user(&pool, "asker@example.org", Role::Receiver).await;
    let claimer = user(&pool, "claimer@example.org", Role::Receiver).await;
    let donation = db::create_donation(&pool, &donor.id, rice(2), Utc::now()).await.expect("create");

    let pending = db::create_request(&pool, &asker.id, &donation.id, None, Utc::now())
        .await
        .expect("create")
        .expect("first request");

    // Nothing to close while the donation is still up for grabs.
    assert!(db::reject_pending_for_donation(&pool, &donation.id, Utc::now())
        .await
        .expect("reject")
        .is_empty());

    assert!(db::claim_donation(&pool, &donation.id, &claimer.id, Utc::now()).await.expect("claim"));
    let closed = db::reject_pending_for_donation(&pool, &donation.id, Utc::now()).await.expect("reject");
    assert_eq!(closed, vec![asker.id.clone()]);

    let pending = db::get_request(&pool, &pending.id).await.expect("get").expect("exists");
    assert_eq!(pending.status, RequestStatus::Rejected);

    // The accept path now sees an unavailable donation.
    let late = db::create_request(&pool, &asker.id, &donation.id, None, Utc::now())
        .await
        .expect("create")
        .expect("no pending request left");
    assert!(matches!(
        db::accept_request(&pool, &late.id, Utc::now()).await.expect("accept"),
        db::AcceptOutcome::DonationUnavailable
    ));
}

#[tokio::test]
async fn claiming_directly_accepts_the_claimants_own_request() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;
    let claimer = user(&pool, "claimer@example.org", Role::Receiver).await;
    let other = user(&pool, "other@example.org", Role::Receiver).await;
    let donation = db::create_donation(&pool, &donor.id, rice(2), Utc::now()).await.expect("create");

    let own = db::create_request(&pool, &claimer.id, &donation.id, None, Utc::now())
        .await
        .expect("create")
        .expect("first request");
    let competing = db::create_request(&pool, &other.id, &donation.id, None, Utc::now())
        .await
        .expect("create")
        .expect("first request");

    assert!(db::claim_donation(&pool, &donation.id, &claimer.id, Utc::now()).await.expect("claim"));
    let closed = db::reject_pending_for_donation(&pool, &donation.id, Utc::now()).await.expect("reject");
    assert_eq!(closed, vec![other.id.clone()]);

    let own = db::get_request(&pool, &own.id).await.expect("get").expect("exists");
    assert_eq!(own.status, RequestStatus::Accepted);
    let competing = db::get_request(&pool, &competing.id).await.expect("get").expect("exists");
    assert_eq!(competing.status, RequestStatus::Rejected);
}

#[tokio::test]
async fn cancelling_rejects_every_pending_request() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;
    let asker = user(&pool, "asker@example.org", Role::Receiver).await;
    let donation = db::create_donation(&pool, &donor.id, rice(2), Utc::now()).await.expect("create");
    db::create_request(&pool, &asker.id, &donation.id, None, Utc::now())
        .await
        .expect("create")
        .expect("first request");

    assert!(db::transition_donation(&pool, &donation.id, DonationStatus::Cancelled, Utc::now())
        .await
        .expect("cancel"));
    let closed = db::reject_pending_for_donation(&pool, &donation.id, Utc::now()).await.expect("reject");
    assert_eq!(closed, vec![asker.id.clone()]);
}

#[tokio::test]
async fn notifications_track_unread() {
    let pool = pool().await;
    let donor = user(&pool, "donor@example.org", Role::Donor).await;

    for kind in [NotificationKind::DonationPosted, NotificationKind::DonationClaimed] {
        db::create_notification(
            &pool,
            NewNotification {
                user_id: donor.id.clone(),
                kind,
                message: format!("{kind}"),
                related_donation: None,
                related_user: None,
            },
            Utc::now(),
        )
        .await
        .expect("notify");
    }

    assert_eq!(db::count_unread(&pool, &donor.id).await.expect("count"), 2);
    let listed = db::list_notifications(&pool, &donor.id, Some(false)).await.expect("list");
    assert_eq!(listed.len(), 2);

    assert!(db::mark_notification_read(&pool, &listed[0].id).await.expect("mark"));
    assert_eq!(db::count_unread(&pool, &donor.id).await.expect("count"), 1);
    assert_eq!(db::list_notifications(&pool, &donor.id, Some(true)).await.expect("list").len(), 1);

    assert_eq!(db::mark_all_read(&pool, &donor.id).await.expect("mark all"), 1);
    assert_eq!(db::count_unread(&pool, &donor.id).await.expect("count"), 0);

    assert!(db::delete_notification(&pool, &listed[1].id).await.expect("delete"));
    assert!(!db::delete_notification(&pool, &listed[1].id).await.expect("delete"));
}

#[tokio::test]
async fn audit_log_filters_by_time() {
    let pool = pool().await;
    db::log_audit(&pool, "u1", "create", "donations", Some("d1"), None).await.expect("audit");
    let cutoff = Utc::now() + Duration::seconds(1);
    assert_eq!(db::list_audit_logs(&pool, None).await.expect("list").len(), 1);
    assert!(db::list_audit_logs(&pool, Some(cutoff)).await.expect("list").is_empty());
}

#[tokio::test]
async fn promoting_an_admin() {
    let pool = pool().await;
    let user = user(&pool, "ops@example.org", Role::Receiver).await;
    assert!(db::set_user_role(&pool, "OPS@example.org", Role::Admin, Utc::now()).await.expect("promote"));
    assert!(!db::set_user_role(&pool, "nobody@example.org", Role::Admin, Utc::now()).await.expect("promote"));

    let admin = db::get_user(&pool, &user.id).await.expect("get").expect("exists");
    assert_eq!(admin.role, Role::Admin);
    assert!(admin.verified);

    let admins = db::list_users(&pool, Some(Role::Admin), Some(true)).await.expect("list");
    assert_eq!(admins.len(), 1);
}
