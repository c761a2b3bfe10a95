//! Tests for conversation CRUD, guarded status transitions, and the
//! pending-queue query.

use xsha_db::models::{ConversationStatus, CredentialKind, GitProtocol};
use xsha_db::queries::conversations;
use xsha_test_utils::{
    create_test_pool, reload_conversation, seed_conversation, seed_credential,
    seed_environment, seed_project, seed_task,
};

#[tokio::test]
async fn insert_starts_pending_without_commit_hash() {
    let pool = create_test_pool().await;
    let conversation = seed_conversation(&pool, None, "add a health endpoint").await;

    assert_eq!(conversation.status, ConversationStatus::Pending);
    assert!(conversation.commit_hash.is_none());
    assert_eq!(conversation.content, "add a health endpoint");
}

#[tokio::test]
async fn update_status_is_unconditional() {
    let pool = create_test_pool().await;
    let conversation = seed_conversation(&pool, None, "x").await;

    conversations::update_status(&pool, conversation.id, ConversationStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(
        reload_conversation(&pool, conversation.id).await.status,
        ConversationStatus::Cancelled
    );

    let missing = conversations::update_status(&pool, 9999, ConversationStatus::Failed).await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn transition_is_guarded_by_current_status() {
    let pool = create_test_pool().await;
    let conversation = seed_conversation(&pool, None, "x").await;

    let rows = conversations::transition_status(
        &pool,
        conversation.id,
        ConversationStatus::Pending,
        ConversationStatus::Running,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    // A second pending->running loses the race and affects nothing.
    let rows = conversations::transition_status(
        &pool,
        conversation.id,
        ConversationStatus::Pending,
        ConversationStatus::Running,
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);
    assert_eq!(
        reload_conversation(&pool, conversation.id).await.status,
        ConversationStatus::Running
    );
}

#[tokio::test]
async fn commit_hash_recorded() {
    let pool = create_test_pool().await;
    let conversation = seed_conversation(&pool, None, "x").await;

    conversations::set_commit_hash(&pool, conversation.id, &"a".repeat(40))
        .await
        .unwrap();
    assert_eq!(
        reload_conversation(&pool, conversation.id)
            .await
            .commit_hash
            .as_deref(),
        Some("a".repeat(40).as_str())
    );
}

#[tokio::test]
async fn pending_query_eager_loads_details_in_order() {
    let pool = create_test_pool().await;

    let credential =
        seed_credential(&pool, CredentialKind::Token, "", "encrypted-blob", None).await;
    let project = seed_project(
        &pool,
        "https://github.com/acme/repo.git",
        GitProtocol::Https,
        Some(credential.id),
    )
    .await;
    let environment =
        seed_environment(&pool, "claude_code", Some(1.0), Some(1024), Default::default()).await;
    let task = seed_task(&pool, Some(project.id), Some(environment.id), "main").await;

    let first = seed_conversation(&pool, Some(task.id), "first").await;
    let second = seed_conversation(&pool, Some(task.id), "second").await;

    // Terminal and running conversations stay out of the queue.
    let done = seed_conversation(&pool, Some(task.id), "done").await;
    conversations::update_status(&pool, done.id, ConversationStatus::Success)
        .await
        .unwrap();

    let pending = conversations::get_pending_with_details(&pool).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].conversation.id, first.id);
    assert_eq!(pending[1].conversation.id, second.id);

    let details = &pending[0];
    assert_eq!(details.task.as_ref().unwrap().id, task.id);
    assert_eq!(details.project.as_ref().unwrap().id, project.id);
    assert_eq!(details.environment.as_ref().unwrap().id, environment.id);
    assert_eq!(details.credential.as_ref().unwrap().id, credential.id);
}

#[tokio::test]
async fn pending_query_tolerates_missing_references() {
    let pool = create_test_pool().await;

    // Task with no environment; conversation with no task at all.
    let project = seed_project(&pool, "https://example.com/r.git", GitProtocol::Https, None).await;
    let task = seed_task(&pool, Some(project.id), None, "main").await;
    seed_conversation(&pool, Some(task.id), "no env").await;
    seed_conversation(&pool, None, "no task").await;

    let pending = conversations::get_pending_with_details(&pool).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending[0].environment.is_none());
    assert!(pending[0].credential.is_none());
    assert!(pending[1].task.is_none());
    assert!(pending[1].project.is_none());
}

#[tokio::test]
async fn get_with_details_works_for_any_status() {
    let pool = create_test_pool().await;
    let conversation = seed_conversation(&pool, None, "x").await;
    conversations::update_status(&pool, conversation.id, ConversationStatus::Failed)
        .await
        .unwrap();

    let details = conversations::get_with_details(&pool, conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(details.conversation.status, ConversationStatus::Failed);

    assert!(conversations::get_with_details(&pool, 424242)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn pending_or_running_gate_for_task() {
    let pool = create_test_pool().await;
    let task = seed_task(&pool, None, None, "main").await;

    assert!(
        !conversations::has_pending_or_running_for_task(&pool, task.id)
            .await
            .unwrap()
    );

    let conversation = seed_conversation(&pool, Some(task.id), "x").await;
    assert!(
        conversations::has_pending_or_running_for_task(&pool, task.id)
            .await
            .unwrap()
    );

    conversations::update_status(&pool, conversation.id, ConversationStatus::Running)
        .await
        .unwrap();
    assert!(
        conversations::has_pending_or_running_for_task(&pool, task.id)
            .await
            .unwrap()
    );

    conversations::update_status(&pool, conversation.id, ConversationStatus::Success)
        .await
        .unwrap();
    assert!(
        !conversations::has_pending_or_running_for_task(&pool, task.id)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn orphaned_running_rows_marked_failed() {
    let pool = create_test_pool().await;

    let running = seed_conversation(&pool, None, "was running").await;
    conversations::update_status(&pool, running.id, ConversationStatus::Running)
        .await
        .unwrap();
    let pending = seed_conversation(&pool, None, "still pending").await;

    let orphans = conversations::fail_orphaned_running(&pool).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, running.id);

    assert_eq!(
        reload_conversation(&pool, running.id).await.status,
        ConversationStatus::Failed
    );
    assert_eq!(
        reload_conversation(&pool, pending.id).await.status,
        ConversationStatus::Pending
    );
}
