use std::sync::Arc;

use approval_core::clock::SystemClock;
use approval_engine::approval_v1::approval_engine_client::ApprovalEngineClient;
use approval_engine::approval_v1::{check_plan_response, *};
use approval_engine::authority::StaticAuthorityResolver;
use approval_engine::gate::PreResolvedExtractor;
use approval_engine::{ApprovalEngineService, ExecutionEngine};
use notifier::NullSink;
use persistence_pg::testing::MemStore;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Server};

async fn spawn(allow_builtin_defaults: bool) -> (ApprovalEngineClient<Channel>, tokio::task::JoinHandle<()>) {
    let store = Arc::new(MemStore::new());
    let engine = Arc::new(ExecutionEngine::new(store.clone(), Arc::new(NullSink), Arc::new(SystemClock)));
    let resolver = Arc::new(StaticAuthorityResolver::new());
    let service = ApprovalEngineService::new(
        store,
        engine,
        Arc::new(PreResolvedExtractor),
        resolver,
        allow_builtin_defaults,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    let client = ApprovalEngineClient::connect(format!("http://{addr}")).await.unwrap();
    (client, handle)
}

fn node(approver_type: ApproverType, approver_ids: &[&str], approval_type: ApprovalType, required: u32) -> ApprovalNode {
    ApprovalNode {
        id: String::new(),
        flow_id: String::new(),
        position: 0,
        title: "review".into(),
        approver_type: approver_type as i32,
        approver_ids: approver_ids.iter().map(|s| s.to_string()).collect(),
        approval_type: approval_type as i32,
        required_approvals: required,
    }
}

async fn seed_rule(client: &mut ApprovalEngineClient<Channel>, project: &str, level: Level, table: &str, field: &str) {
    client
        .create_rule(CreateRuleRequest {
            project: project.into(),
            title: format!("{table}.{field}"),
            level: level as i32,
            enabled: true,
            table_pattern: table.into(),
            field_patterns: vec![FieldPattern { name_or_glob: field.into(), regex: String::new() }],
            creator: "alice".into(),
        })
        .await
        .unwrap();
}

async fn seed_flow(
    client: &mut ApprovalEngineClient<Channel>,
    project: &str,
    level: Level,
    nodes: Vec<ApprovalNode>,
) {
    client
        .create_flow(CreateFlowRequest {
            project: project.into(),
            title: "review flow".into(),
            level: level as i32,
            enabled: true,
            nodes,
            creator: "alice".into(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn low_sensitivity_self_approval_flow_resolves() {
    let (mut client, _h) = spawn(false).await;
    seed_rule(&mut client, "proj", Level::Low, "users", "email").await;
    seed_flow(
        &mut client,
        "proj",
        Level::Low,
        vec![node(ApproverType::SelfRequester, &[], ApprovalType::All, 1)],
    )
    .await;

    let verdict = client
        .check_plan(CheckPlanRequest {
            project: "proj".into(),
            issue_id: "issue-1".into(),
            creator: "alice".into(),
            sql: "users.email".into(),
            database: "db".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(verdict.verdict, check_plan_response::Verdict::Block as i32);
    let execution_id = verdict.execution_id;

    let decision = client
        .record_decision(RecordDecisionRequest {
            execution_id,
            position: 1,
            actor: "alice".into(),
            decision: Decision::Approved as i32,
            comment: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(decision.node_status, NodeExecutionStatus::Approved as i32);
    assert_eq!(decision.flow_status, FlowExecutionStatus::Approved as i32);
}

#[tokio::test]
async fn high_sensitivity_two_step_all_flow_promotes_then_completes() {
    let (mut client, _h) = spawn(false).await;
    seed_rule(&mut client, "proj", Level::High, "payments", "card_number").await;
    seed_flow(
        &mut client,
        "proj",
        Level::High,
        vec![
            node(ApproverType::User, &["bob"], ApprovalType::All, 1),
            node(ApproverType::User, &["carol"], ApprovalType::All, 1),
        ],
    )
    .await;

    let verdict = client
        .check_plan(CheckPlanRequest {
            project: "proj".into(),
            issue_id: "issue-2".into(),
            creator: "alice".into(),
            sql: "payments.card_number".into(),
            database: "db".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(verdict.verdict, check_plan_response::Verdict::Block as i32);
    let execution_id = verdict.execution_id;

    let first = client
        .record_decision(RecordDecisionRequest {
            execution_id: execution_id.clone(),
            position: 1,
            actor: "bob".into(),
            decision: Decision::Approved as i32,
            comment: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(first.node_status, NodeExecutionStatus::Approved as i32);
    assert_eq!(first.flow_status, FlowExecutionStatus::InProgress as i32);

    let execution = client
        .get_execution(GetExecutionRequest { id: execution_id.clone() })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(execution.current_position, Some(2));

    let second = client
        .record_decision(RecordDecisionRequest {
            execution_id,
            position: 2,
            actor: "carol".into(),
            decision: Decision::Approved as i32,
            comment: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(second.node_status, NodeExecutionStatus::Approved as i32);
    assert_eq!(second.flow_status, FlowExecutionStatus::Approved as i32);
}

#[tokio::test]
async fn rejection_at_first_step_short_circuits_remaining_nodes() {
    let (mut client, _h) = spawn(false).await;
    seed_rule(&mut client, "proj", Level::High, "payments", "card_number").await;
    seed_flow(
        &mut client,
        "proj",
        Level::High,
        vec![
            node(ApproverType::User, &["bob"], ApprovalType::All, 1),
            node(ApproverType::User, &["carol"], ApprovalType::All, 1),
        ],
    )
    .await;

    let verdict = client
        .check_plan(CheckPlanRequest {
            project: "proj".into(),
            issue_id: "issue-3".into(),
            creator: "alice".into(),
            sql: "payments.card_number".into(),
            database: "db".into(),
        })
        .await
        .unwrap()
        .into_inner();
    let execution_id = verdict.execution_id;

    let decision = client
        .record_decision(RecordDecisionRequest {
            execution_id: execution_id.clone(),
            position: 1,
            actor: "bob".into(),
            decision: Decision::Rejected as i32,
            comment: "not today".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(decision.node_status, NodeExecutionStatus::Rejected as i32);
    assert_eq!(decision.flow_status, FlowExecutionStatus::Rejected as i32);

    let stuck = client
        .record_decision(RecordDecisionRequest {
            execution_id,
            position: 2,
            actor: "carol".into(),
            decision: Decision::Approved as i32,
            comment: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(stuck.code(), tonic::Code::FailedPrecondition);
}

#[tokio::test]
async fn any_quorum_settles_on_first_approval() {
    let (mut client, _h) = spawn(false).await;
    seed_rule(&mut client, "proj", Level::Medium, "orders", "shipping_address").await;
    seed_flow(
        &mut client,
        "proj",
        Level::Medium,
        vec![node(ApproverType::User, &["bob", "carol", "dave"], ApprovalType::Any, 1)],
    )
    .await;

    let verdict = client
        .check_plan(CheckPlanRequest {
            project: "proj".into(),
            issue_id: "issue-4".into(),
            creator: "alice".into(),
            sql: "orders.shipping_address".into(),
            database: "db".into(),
        })
        .await
        .unwrap()
        .into_inner();
    let execution_id = verdict.execution_id;

    let first = client
        .record_decision(RecordDecisionRequest {
            execution_id,
            position: 1,
            actor: "bob".into(),
            decision: Decision::Approved as i32,
            comment: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(first.node_status, NodeExecutionStatus::Approved as i32);
    assert_eq!(first.flow_status, FlowExecutionStatus::Approved as i32);
}

#[tokio::test]
async fn all_quorum_ignores_duplicate_decisions_from_the_same_actor() {
    let (mut client, _h) = spawn(false).await;
    seed_rule(&mut client, "proj", Level::Medium, "orders", "shipping_address").await;
    seed_flow(
        &mut client,
        "proj",
        Level::Medium,
        vec![node(ApproverType::User, &["bob", "carol", "dave"], ApprovalType::All, 3)],
    )
    .await;

    let verdict = client
        .check_plan(CheckPlanRequest {
            project: "proj".into(),
            issue_id: "issue-4".into(),
            creator: "alice".into(),
            sql: "orders.shipping_address".into(),
            database: "db".into(),
        })
        .await
        .unwrap()
        .into_inner();
    let execution_id = verdict.execution_id;

    let first = client
        .record_decision(RecordDecisionRequest {
            execution_id: execution_id.clone(),
            position: 1,
            actor: "bob".into(),
            decision: Decision::Approved as i32,
            comment: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(first.flow_status, FlowExecutionStatus::InProgress as i32);

    let duplicate = client
        .record_decision(RecordDecisionRequest {
            execution_id: execution_id.clone(),
            position: 1,
            actor: "bob".into(),
            decision: Decision::Approved as i32,
            comment: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(duplicate.code(), tonic::Code::AlreadyExists);

    let second = client
        .record_decision(RecordDecisionRequest {
            execution_id: execution_id.clone(),
            position: 1,
            actor: "carol".into(),
            decision: Decision::Approved as i32,
            comment: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(second.flow_status, FlowExecutionStatus::InProgress as i32);

    let third = client
        .record_decision(RecordDecisionRequest {
            execution_id,
            position: 1,
            actor: "dave".into(),
            decision: Decision::Approved as i32,
            comment: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(third.node_status, NodeExecutionStatus::Approved as i32);
    assert_eq!(third.flow_status, FlowExecutionStatus::Approved as i32);
}

#[tokio::test]
async fn matched_change_with_no_configured_flow_is_denied() {
    let (mut client, _h) = spawn(false).await;
    seed_rule(&mut client, "proj", Level::High, "secrets", "token").await;

    let err = client
        .check_plan(CheckPlanRequest {
            project: "proj".into(),
            issue_id: "issue-5".into(),
            creator: "alice".into(),
            sql: "secrets.token".into(),
            database: "db".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);
}

#[tokio::test]
async fn concurrent_check_plan_for_the_same_issue_produces_a_single_execution() {
    let (mut client, _h) = spawn(false).await;
    seed_rule(&mut client, "proj", Level::Low, "users", "email").await;
    seed_flow(
        &mut client,
        "proj",
        Level::Low,
        vec![node(ApproverType::User, &["bob"], ApprovalType::All, 1)],
    )
    .await;

    let mut a = client.clone();
    let mut b = client.clone();
    let request = |c: &mut ApprovalEngineClient<Channel>| {
        let mut c = c.clone();
        async move {
            c.check_plan(CheckPlanRequest {
                project: "proj".into(),
                issue_id: "issue-6".into(),
                creator: "alice".into(),
                sql: "users.email".into(),
                database: "db".into(),
            })
            .await
            .unwrap()
            .into_inner()
        }
    };
    let (first, second) = tokio::join!(request(&mut a), request(&mut b));

    assert_eq!(first.verdict, check_plan_response::Verdict::Block as i32);
    assert_eq!(second.verdict, check_plan_response::Verdict::Block as i32);
    assert_eq!(first.execution_id, second.execution_id);

    let executions = client
        .list_executions(ListExecutionsRequest { project: "proj".into() })
        .await
        .unwrap()
        .into_inner()
        .executions;
    assert_eq!(executions.len(), 1);
}
