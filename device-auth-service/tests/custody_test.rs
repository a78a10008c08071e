//! Device custody ledger: ownership changes, their history and atomicity.

mod common;

use common::{client, yubikey, TestContext};
use device_auth_service::{
    models::{DeregistrationReason, DeviceRegistration, DeviceType, RegistrationAction},
    services::{
        AuthError, CustodyError, DeregisterDevice, RegisterDevice, TargetUser, TransferDevice,
    },
};
use uuid::Uuid;

fn register(target: TargetUser, identifier: &str) -> RegisterDevice {
    RegisterDevice {
        target,
        device_type: DeviceType::Yubikey,
        identifier: identifier.to_string(),
        notes: None,
    }
}

fn transfer(target: TargetUser, notes: Option<&str>) -> TransferDevice {
    TransferDevice {
        target,
        notes: notes.map(str::to_string),
    }
}

/// Owner implied by replaying the ledger oldest first.
fn replay_owner(history_newest_first: &[DeviceRegistration]) -> Option<Uuid> {
    history_newest_first
        .iter()
        .rev()
        .fold(None, |_, row| match row.action_type {
            RegistrationAction::Register => row.target_user_id,
            RegistrationAction::Deregister => None,
        })
}

#[tokio::test]
async fn register_then_transfer_reads_as_a_continuous_chain() {
    let ctx = TestContext::new();
    let (custodian, custodian_key) = ctx.custodian().await;
    let u1 = ctx.user_with("u1", &[]).await;
    let u2 = ctx.user_with("u2", &[]).await;
    let new_key = common::public_id();

    let registered = ctx
        .custody
        .register_device(
            &yubikey(&custodian_key),
            register(TargetUser::Id(u1.user_id), &new_key),
            &client(),
        )
        .await
        .expect("register");
    let device_id = registered.device.device_id;
    assert_eq!(registered.device.user_id, Some(u1.user_id));

    let transferred = ctx
        .custody
        .transfer_device(
            &yubikey(&custodian_key),
            device_id,
            transfer(TargetUser::Email(u2.email.clone()), Some("desk swap")),
            &client(),
        )
        .await
        .expect("transfer");
    assert_eq!(transferred.device.user_id, Some(u2.user_id));
    assert_eq!(transferred.registrations.len(), 2);

    let history = ctx.custody.device_history(device_id).await.unwrap();
    let summary: Vec<(RegistrationAction, Option<Uuid>, Option<&str>)> = history
        .iter()
        .map(|e| {
            (
                e.registration.action_type,
                e.registration.target_user_id,
                e.registration.reason.as_deref(),
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            (RegistrationAction::Register, Some(u2.user_id), None),
            (RegistrationAction::Deregister, None, Some("device_transfer")),
            (RegistrationAction::Register, Some(u1.user_id), None),
        ]
    );

    let notes = history[1].registration.notes.as_deref().unwrap();
    assert!(notes.contains(&u1.user_id.to_string()));
    assert!(notes.ends_with("desk swap"));

    assert!(history
        .iter()
        .all(|e| e.registrar.as_ref().map(|r| r.user_id) == Some(custodian.user_id)));
    assert_eq!(
        history[0].target_user.as_ref().map(|u| u.username.as_str()),
        Some("u2")
    );

    let rows: Vec<DeviceRegistration> = history.into_iter().map(|e| e.registration).collect();
    assert_eq!(replay_owner(&rows), Some(u2.user_id));
    assert_eq!(
        ctx.store.device(device_id).await.unwrap().user_id,
        Some(u2.user_id)
    );
}

#[tokio::test]
async fn full_otp_registers_its_public_identifier() {
    let ctx = TestContext::new();
    let (_, custodian_key) = ctx.custodian().await;
    let owner = ctx.user_with("owner", &[]).await;
    let new_key = common::public_id();

    let change = ctx
        .custody
        .register_device(
            &yubikey(&custodian_key),
            register(
                TargetUser::Id(owner.user_id),
                &common::otp_for(&new_key).to_uppercase(),
            ),
            &client(),
        )
        .await
        .unwrap();

    assert_eq!(change.device.identifier, new_key);
    assert!(change.device.active_flag);
    assert!(change.device.verified_utc.is_some());
}

#[tokio::test]
async fn device_owned_by_someone_else_cannot_be_registered() {
    let ctx = TestContext::new();
    let (_, custodian_key) = ctx.custodian().await;
    let holder = ctx.user_with("holder", &[]).await;
    let other = ctx.user_with("other", &[]).await;
    let (device, public_id) = ctx.yubikey_for(Some(holder.user_id)).await;

    let err = ctx
        .custody
        .register_device(
            &yubikey(&custodian_key),
            register(TargetUser::Id(other.user_id), &public_id),
            &client(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::AlreadyRegistered));

    // Re-registering to the current owner is accepted.
    ctx.custody
        .register_device(
            &yubikey(&custodian_key),
            register(TargetUser::Id(holder.user_id), &public_id),
            &client(),
        )
        .await
        .expect("same owner re-registration");
    assert_eq!(
        ctx.store.device(device.device_id).await.unwrap().user_id,
        Some(holder.user_id)
    );
}

#[tokio::test]
async fn malformed_identifier_is_rejected_before_the_registrar_otp_is_used() {
    let ctx = TestContext::new();
    let (_, custodian_key) = ctx.custodian().await;
    let target = ctx.user_with("target", &[]).await;
    let registrar = yubikey(&custodian_key);

    let err = ctx
        .custody
        .register_device(
            &registrar,
            register(TargetUser::Id(target.user_id), "not-modhex!"),
            &client(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::Validation(_)));
    assert_eq!(ctx.authority.calls(), 0);
    assert!(ctx.store.auth_logs().await.is_empty());

    // The same OTP is still good for a well-formed request.
    ctx.custody
        .register_device(
            &registrar,
            register(TargetUser::Id(target.user_id), &common::public_id()),
            &client(),
        )
        .await
        .expect("registrar OTP was not consumed");
}

#[tokio::test]
async fn deregister_clears_owner_and_deactivates() {
    let ctx = TestContext::new();
    let (_, custodian_key) = ctx.custodian().await;
    let holder = ctx.user_with("holder", &[]).await;
    let (device, _) = ctx.yubikey_for(Some(holder.user_id)).await;

    let change = ctx
        .custody
        .deregister_device(
            &yubikey(&custodian_key),
            device.device_id,
            DeregisterDevice {
                reason: DeregistrationReason::DeviceLost,
                notes: Some("  left on train ".to_string()),
            },
            &client(),
        )
        .await
        .unwrap();

    assert_eq!(change.device.user_id, None);
    assert!(!change.device.active_flag);
    let row = &change.registrations[0];
    assert_eq!(row.action_type, RegistrationAction::Deregister);
    assert_eq!(row.target_user_id, None);
    assert_eq!(row.reason.as_deref(), Some("device_lost"));
    assert_eq!(row.notes.as_deref(), Some("left on train"));

    let err = ctx
        .custody
        .deregister_device(
            &yubikey(&custodian_key),
            device.device_id,
            DeregisterDevice {
                reason: DeregistrationReason::Administrative,
                notes: None,
            },
            &client(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::NotRegistered));
}

#[tokio::test]
async fn failed_transfer_leaves_owner_and_ledger_untouched() {
    let ctx = TestContext::new();
    let (_, custodian_key) = ctx.custodian().await;
    let holder = ctx.user_with("holder", &[]).await;
    let inactive = ctx.user_with("inactive", &[]).await;
    ctx.store.set_user_active(inactive.user_id, false).await;
    let (device, _) = ctx.yubikey_for(Some(holder.user_id)).await;

    let err = ctx
        .custody
        .transfer_device(
            &yubikey(&custodian_key),
            device.device_id,
            transfer(TargetUser::Id(inactive.user_id), None),
            &client(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::TargetUserInactive));

    let err = ctx
        .custody
        .transfer_device(
            &yubikey(&custodian_key),
            device.device_id,
            transfer(TargetUser::Id(holder.user_id), None),
            &client(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::SameOwner));

    assert_eq!(
        ctx.store.device(device.device_id).await.unwrap().user_id,
        Some(holder.user_id)
    );
    assert!(ctx.store.registrations().await.is_empty());
}

#[tokio::test]
async fn ledger_write_failure_mid_transfer_rolls_everything_back() {
    let ctx = TestContext::new();
    let (_, custodian_key) = ctx.custodian().await;
    let holder = ctx.user_with("holder", &[]).await;
    let next = ctx.user_with("next", &[]).await;
    let (device, _) = ctx.yubikey_for(Some(holder.user_id)).await;

    // The deregister row goes in, the register row fails.
    ctx.store.fail_registration_insert(2);
    let err = ctx
        .custody
        .transfer_device(
            &yubikey(&custodian_key),
            device.device_id,
            transfer(TargetUser::Id(next.user_id), None),
            &client(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::Store(_)));

    assert_eq!(
        ctx.store.device(device.device_id).await.unwrap().user_id,
        Some(holder.user_id)
    );
    assert!(ctx.store.registrations().await.is_empty());
}

#[tokio::test]
async fn registrar_without_custody_permission_is_forbidden() {
    let ctx = TestContext::new();
    let clerk = ctx.user_with("clerk", &[("custody", "read")]).await;
    let (_, clerk_key) = ctx.yubikey_for(Some(clerk.user_id)).await;
    let target = ctx.user_with("target", &[]).await;

    let err = ctx
        .custody
        .register_device(
            &yubikey(&clerk_key),
            register(TargetUser::Id(target.user_id), &common::public_id()),
            &client(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CustodyError::Auth(AuthError::PermissionDenied(ref p)) if p == "custody:register-other"
    ));
    assert!(ctx.store.registrations().await.is_empty());
}

#[tokio::test]
async fn unknown_target_email_is_not_found() {
    let ctx = TestContext::new();
    let (_, custodian_key) = ctx.custodian().await;

    let err = ctx
        .custody
        .register_device(
            &yubikey(&custodian_key),
            register(
                TargetUser::Email("nobody@example.com".to_string()),
                &common::public_id(),
            ),
            &client(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::TargetUserNotFound));
}

#[tokio::test]
async fn history_requires_custody_read() {
    let ctx = TestContext::new();
    let (custodian, custodian_key) = ctx.custodian().await;
    let nosy = ctx.user_with("nosy", &[]).await;
    let (_, nosy_key) = ctx.yubikey_for(Some(nosy.user_id)).await;
    let (device, _) = ctx.yubikey_for(Some(nosy.user_id)).await;

    assert!(matches!(
        ctx.custody
            .device_history_for(&yubikey(&nosy_key), device.device_id, &client())
            .await,
        Err(CustodyError::Auth(AuthError::PermissionDenied(_)))
    ));

    let history = ctx
        .custody
        .device_history_for(&yubikey(&custodian_key), device.device_id, &client())
        .await
        .expect("custodian may read history");
    assert!(history.is_empty());

    ctx.custody
        .device_history_for_user(custodian.user_id, device.device_id)
        .await
        .expect("session caller with custody:read");

    assert!(matches!(
        ctx.custody.device_history(Uuid::new_v4()).await,
        Err(CustodyError::DeviceNotFound)
    ));
}

#[tokio::test]
async fn replayed_history_matches_ownership_after_mixed_operations() {
    let ctx = TestContext::new();
    let (_, custodian_key) = ctx.custodian().await;
    let users = [
        ctx.user_with("a", &[]).await,
        ctx.user_with("b", &[]).await,
        ctx.user_with("c", &[]).await,
    ];
    let public_id = common::public_id();

    let device_id = ctx
        .custody
        .register_device(
            &yubikey(&custodian_key),
            register(TargetUser::Id(users[0].user_id), &public_id),
            &client(),
        )
        .await
        .unwrap()
        .device
        .device_id;

    ctx.custody
        .transfer_device(
            &yubikey(&custodian_key),
            device_id,
            transfer(TargetUser::Id(users[1].user_id), None),
            &client(),
        )
        .await
        .unwrap();
    ctx.custody
        .deregister_device(
            &yubikey(&custodian_key),
            device_id,
            DeregisterDevice {
                reason: DeregistrationReason::UserLeft,
                notes: None,
            },
            &client(),
        )
        .await
        .unwrap();

    let rows: Vec<DeviceRegistration> = ctx
        .custody
        .device_history(device_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.registration)
        .collect();
    assert_eq!(replay_owner(&rows), None);
    assert_eq!(ctx.store.device(device_id).await.unwrap().user_id, None);

    ctx.custody
        .register_device(
            &yubikey(&custodian_key),
            register(TargetUser::Id(users[2].user_id), &public_id),
            &client(),
        )
        .await
        .unwrap();

    let rows: Vec<DeviceRegistration> = ctx
        .custody
        .device_history(device_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.registration)
        .collect();
    assert_eq!(rows.len(), 5);
    assert_eq!(replay_owner(&rows), Some(users[2].user_id));
    let device = ctx.store.device(device_id).await.unwrap();
    assert_eq!(device.user_id, Some(users[2].user_id));
    assert!(device.active_flag);
}
