//! End-to-end tests of the runtime.
//!
//! Command → EventStore → Projection → ReadModel, plus snapshots, the side-effect
//! gate, restarts over persistent stores and scheduled commands.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use futures::StreamExt;
    use serde::{Deserialize, Serialize};
    use serde_json::{Value as JsonValue, json};
    use tokio::sync::Barrier;

    use chronicle_core::{DomainError, DomainResult, ExpectedRevision, Position};
    use chronicle_events::{Event, EventCaster, EventEnvelope};

    use crate::aggregate::{Aggregate, CommandContext, CommandOptions, Payload, StateUpdate};
    use crate::context::ProjectionContext;
    use crate::event_store::{
        EventFilter, EventStore, EventStoreError, EventStream, InMemoryEventStore, ReadOptions,
        SubscribeOptions,
    };
    use crate::projections::Projector;
    use crate::read_model::{QueryContext, ReadModel};
    use crate::runtime::{DEFAULT_STORE, Runtime, RuntimeConfig};
    use crate::scheduler::LocalScheduler;
    use crate::snapshot::SnapshotConfig;
    use crate::store::{InMemoryStoreProvider, StoreProvider, TableDefinition, TypedTable};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Opened {
        initial_balance: i64,
    }

    impl Event for Opened {
        const NAME: &'static str = "AccountOpened";
        const VERSION: u32 = 1;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Credited {
        amount: i64,
    }

    impl Event for Credited {
        const NAME: &'static str = "AccountCredited";
        const VERSION: u32 = 1;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Withdrawn {
        amount: i64,
    }

    impl Event for Withdrawn {
        const NAME: &'static str = "AccountWithdrawn";
        const VERSION: u32 = 1;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Flagged {
        amount: i64,
    }

    impl Event for Flagged {
        const NAME: &'static str = "AuditFlagged";
        const VERSION: u32 = 1;
    }

    #[derive(Debug, Deserialize)]
    struct Amount {
        amount: i64,
    }

    impl Payload for Amount {
        fn validate(&self) -> DomainResult<()> {
            if self.amount <= 0 {
                return Err(DomainError::bad_request("amount must be positive"));
            }
            Ok(())
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Open {
        initial_balance: i64,
    }

    impl Payload for Open {
        fn validate(&self) -> DomainResult<()> {
            if self.initial_balance < 0 {
                return Err(DomainError::bad_request("initial balance must not be negative"));
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Account {
        opened: bool,
        balance: i64,
    }

    fn open(state: &Account, p: Open, ctx: &CommandContext) -> DomainResult<StateUpdate> {
        if state.opened {
            return Err(DomainError::duplicate_aggregate(ctx.aggregate_id.clone()));
        }
        StateUpdate::event(Opened {
            initial_balance: p.initial_balance,
        })
    }

    fn credit(_: &Account, p: Amount, _: &CommandContext) -> DomainResult<StateUpdate> {
        StateUpdate::event(Credited { amount: p.amount })
    }

    fn debit(state: &Account, p: Amount, _: &CommandContext) -> DomainResult<StateUpdate> {
        if state.balance < p.amount {
            return Err(DomainError::bad_request("insufficient funds"));
        }
        StateUpdate::event(Withdrawn { amount: p.amount })
    }

    fn flag(_: &(), p: Amount, _: &CommandContext) -> DomainResult<StateUpdate> {
        StateUpdate::event(Flagged { amount: p.amount })
    }

    fn account() -> Aggregate<Account> {
        Aggregate::new("account", Account::default)
            .on(|_: Account, e: Opened| Account {
                opened: true,
                balance: e.initial_balance,
            })
            .unwrap()
            .on(|s: Account, e: Credited| Account {
                balance: s.balance + e.amount,
                ..s
            })
            .unwrap()
            .on(|s: Account, e: Withdrawn| Account {
                balance: s.balance - e.amount,
                ..s
            })
            .unwrap()
            .with_command(open, CommandOptions::default())
            .unwrap()
            .with_command(credit, CommandOptions::default())
            .unwrap()
            .with_command(debit, CommandOptions::default())
            .unwrap()
    }

    fn audit() -> Aggregate<()> {
        Aggregate::new("audit", || ())
            .with_command(flag, CommandOptions::default())
            .unwrap()
    }

    fn caster() -> EventCaster {
        EventCaster::new()
            .with::<Opened>()
            .unwrap()
            .with::<Credited>()
            .unwrap()
            .with::<Withdrawn>()
            .unwrap()
            .with::<Flagged>()
            .unwrap()
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct BalanceKey {
        id: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Balance {
        balance: i64,
    }

    async fn add_to_balance(ctx: &ProjectionContext, delta: i64) -> DomainResult<()> {
        let table: TypedTable<BalanceKey, Balance> = TypedTable::new(ctx.table("balances")?);
        let key = BalanceKey {
            id: ctx.current_event().aggregate_id().to_string(),
        };
        let current = table.get(&key).await?.map(|b| b.balance).unwrap_or(0);
        table.set(&key, &Balance { balance: current + delta }).await?;
        Ok(())
    }

    /// Large credits are flagged on the audit aggregate, a side effect.
    fn balances() -> Projector {
        Projector::new("balances", 1)
            .unwrap()
            .with_table(TableDefinition::new("balances", ["id"]))
            .on(|ctx: ProjectionContext, e: Opened| async move { add_to_balance(&ctx, e.initial_balance).await })
            .unwrap()
            .on(|ctx: ProjectionContext, e: Credited| async move {
                add_to_balance(&ctx, e.amount).await?;
                if e.amount >= 100 {
                    let account = ctx.current_event().aggregate_id().to_string();
                    ctx.execute_command("audit", &account, "flag", json!({"amount": e.amount}), JsonValue::Null)
                        .await?;
                }
                Ok::<(), DomainError>(())
            })
            .unwrap()
            .on(|ctx: ProjectionContext, e: Withdrawn| async move { add_to_balance(&ctx, -e.amount).await })
            .unwrap()
    }

    #[derive(Debug, Deserialize)]
    struct ById {
        id: String,
    }

    impl Payload for ById {}

    fn balances_read_model() -> ReadModel {
        ReadModel::new("Balances", "balances")
            .handle("get", |ctx: QueryContext, q: ById| async move {
                let table: TypedTable<BalanceKey, Balance> = TypedTable::new(ctx.table("balances")?);
                let balance = table.get(&BalanceKey { id: q.id }).await?.map(|b| b.balance);
                Ok::<Option<i64>, DomainError>(balance)
            })
            .unwrap()
    }

    fn config(event_store: Arc<dyn EventStore>, internal: Arc<InMemoryStoreProvider>) -> RuntimeConfig {
        RuntimeConfig::new(event_store, internal)
            .with_events(caster())
            .with_aggregate(account())
            .with_aggregate(audit())
            .with_projector(balances())
            .with_read_model(balances_read_model())
    }

    async fn run(runtime: &Runtime, command: &str, id: &str, amount: i64) -> DomainResult<Vec<EventEnvelope>> {
        runtime
            .execute_command("account", id, command, json!({ "amount": amount }), JsonValue::Null)
            .await
    }

    async fn wait_for(runtime: &Runtime, version: u32, position: Position) {
        let projection = runtime.projection("balances", version).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), projection.wait_for_position(position))
            .await
            .expect("projection did not catch up")
            .unwrap();
    }

    async fn stream_len(store: &InMemoryEventStore, aggregate_type: &str, id: &str) -> usize {
        let mut stream = store.read(aggregate_type, id, ReadOptions::default()).await.unwrap();
        let mut count = 0;
        while let Some(Ok(_)) = stream.next().await {
            count += 1;
        }
        count
    }

    async fn balance(runtime: &Runtime, id: &str) -> JsonValue {
        runtime
            .execute_query("balances", "get", json!({ "id": id }), JsonValue::Null)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn account_scenario() {
        let event_store = Arc::new(InMemoryEventStore::new());
        let runtime = Runtime::create(config(event_store.clone(), Arc::new(InMemoryStoreProvider::new())))
            .await
            .unwrap();
        runtime.add_projection("balances", 1, "balances", 1, DEFAULT_STORE).await.unwrap();
        runtime.set_projection_active("balances", 1, false).await.unwrap();

        runtime
            .execute_command("account", "a1", "open", json!({ "initialBalance": 0 }), JsonValue::Null)
            .await
            .unwrap();
        run(&runtime, "credit", "a1", 10).await.unwrap();
        let debited = run(&runtime, "debit", "a1", 4).await.unwrap();
        assert_eq!(debited[0].aggregate_id(), "a1");

        let err = run(&runtime, "debit", "a1", 10).await.unwrap_err();
        assert!(err.is_bad_request());
        let err = run(&runtime, "credit", "a1", -1).await.unwrap_err();
        assert!(err.is_bad_request());
        let err = runtime
            .execute_command("account", "a1", "open", json!({ "initialBalance": 5 }), JsonValue::Null)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(event_store.len(), 3);

        wait_for(&runtime, 1, debited[0].position().unwrap()).await;
        assert_eq!(balance(&runtime, "a1").await, json!(6));
        assert_eq!(balance(&runtime, "nobody").await, JsonValue::Null);

        runtime.stop().await.unwrap();
    }

    /// Holds every `read` until a second one arrives, so two commands hydrate the
    /// same revision before either appends.
    struct GatedStore {
        inner: InMemoryEventStore,
        reads: Barrier,
    }

    #[async_trait]
    impl EventStore for GatedStore {
        async fn connect(&self) -> Result<(), EventStoreError> {
            self.inner.connect().await
        }

        async fn close(&self, force: bool) -> Result<(), EventStoreError> {
            self.inner.close(force).await
        }

        async fn read(
            &self,
            aggregate_type: &str,
            aggregate_id: &str,
            options: ReadOptions,
        ) -> Result<EventStream, EventStoreError> {
            self.reads.wait().await;
            self.inner.read(aggregate_type, aggregate_id, options).await
        }

        async fn append(
            &self,
            aggregate_type: &str,
            aggregate_id: &str,
            events: Vec<EventEnvelope>,
            expected: ExpectedRevision,
        ) -> Result<Vec<EventEnvelope>, EventStoreError> {
            self.inner.append(aggregate_type, aggregate_id, events, expected).await
        }

        async fn subscribe(&self, options: SubscribeOptions) -> Result<EventStream, EventStoreError> {
            self.inner.subscribe(options).await
        }

        async fn latest_position(&self, filter: &EventFilter) -> Result<Option<Position>, EventStoreError> {
            self.inner.latest_position(filter).await
        }
    }

    #[tokio::test]
    async fn concurrent_commands_on_one_aggregate_conflict() {
        let event_store = Arc::new(GatedStore {
            inner: InMemoryEventStore::new(),
            reads: Barrier::new(2),
        });
        let runtime = Runtime::create(config(event_store.clone(), Arc::new(InMemoryStoreProvider::new())))
            .await
            .unwrap();

        let (first, second) = tokio::join!(run(&runtime, "credit", "a1", 5), run(&runtime, "credit", "a1", 7));
        let conflicts = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_conflict()))
            .count();
        assert_eq!(conflicts, 1);
        assert!(first.is_ok() || second.is_ok());

        let (first, second) = tokio::join!(run(&runtime, "credit", "b1", 5), run(&runtime, "credit", "b2", 7));
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(event_store.inner.len(), 3);

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn snapshots_do_not_change_hydrated_state() {
        let event_store = Arc::new(InMemoryEventStore::new());
        let internal = Arc::new(InMemoryStoreProvider::new());
        let runtime = Runtime::create(
            config(event_store.clone(), internal.clone())
                .with_snapshots(SnapshotConfig::new().with_event_count(2).into()),
        )
        .await
        .unwrap();
        for amount in 1..=5 {
            run(&runtime, "credit", "a1", amount).await.unwrap();
        }
        runtime.stop().await.unwrap();

        let caster = caster();
        let plain = account();
        let mut snapshotting = account();
        snapshotting
            .snapshotter_mut()
            .configure([Some(SnapshotConfig::new().with_event_count(2).into())]);
        snapshotting
            .snapshotter_mut()
            .set_store(Some(internal.create("_snapshots_account")))
            .await
            .unwrap();
        let stored = snapshotting.snapshotter().get("a1").await.unwrap().unwrap();
        assert_eq!(stored.aggregate_version, 4);

        let from_genesis = plain.load_state(event_store.as_ref(), &caster, "a1").await.unwrap();
        let from_snapshot = snapshotting.load_state(event_store.as_ref(), &caster, "a1").await.unwrap();
        assert_eq!(from_genesis.state, Account { opened: false, balance: 15 });
        assert_eq!(from_genesis.state, from_snapshot.state);
        assert_eq!(from_genesis.revision, from_snapshot.revision);
        assert_eq!(from_snapshot.aggregate_version, 5);
    }

    #[tokio::test]
    async fn side_effects_run_once_for_the_live_active_projection() {
        let event_store = Arc::new(InMemoryEventStore::new());
        let runtime = Runtime::create(config(event_store.clone(), Arc::new(InMemoryStoreProvider::new())))
            .await
            .unwrap();

        let info = runtime.add_projection("balances", 1, "balances", 1, DEFAULT_STORE).await.unwrap();
        assert!(info.is_live_tracking);
        assert!(!info.is_replaying);
        runtime.set_projection_active("balances", 1, false).await.unwrap();

        let credited = run(&runtime, "credit", "a1", 150).await.unwrap();
        let position = credited[0].position().unwrap();
        wait_for(&runtime, 1, position).await;
        assert_eq!(stream_len(&event_store, "audit", "a1").await, 1);

        // Rebuilding into a second version replays the credit without flagging again.
        runtime.add_projection("balances", 2, "balances", 1, DEFAULT_STORE).await.unwrap();
        wait_for(&runtime, 2, position).await;
        let rebuilt = runtime.get_projection("balances", 2).await.unwrap();
        assert!(rebuilt.is_live_tracking);
        assert!(!rebuilt.is_active);
        assert_eq!(stream_len(&event_store, "audit", "a1").await, 1);

        runtime.set_projection_active("balances", 2, false).await.unwrap();
        assert!(!runtime.get_projection("balances", 1).await.unwrap().is_active);
        assert_eq!(balance(&runtime, "a1").await, json!(150));

        let err = runtime.remove_projection("balances", 2, false).await.unwrap_err();
        assert!(err.is_conflict());
        runtime.remove_projection("balances", 1, false).await.unwrap();
        assert_eq!(runtime.get_projections().await.len(), 1);

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn projection_configuration_survives_a_restart() {
        let event_store = Arc::new(InMemoryEventStore::new());
        let internal = Arc::new(InMemoryStoreProvider::new());

        let first = Runtime::create(config(event_store.clone(), internal.clone())).await.unwrap();
        first.add_projection("balances", 1, "balances", 1, DEFAULT_STORE).await.unwrap();
        first.set_projection_active("balances", 1, false).await.unwrap();
        let credited = run(&first, "credit", "a1", 10).await.unwrap();
        wait_for(&first, 1, credited[0].position().unwrap()).await;
        first.stop().await.unwrap();

        let second = Runtime::create(config(event_store.clone(), internal)).await.unwrap();
        let info = second.get_projection("balances", 1).await.unwrap();
        assert!(info.is_active);
        assert!(info.is_live_tracking);
        assert_eq!(info.processed_position, credited[0].position());
        assert_eq!(balance(&second, "a1").await, json!(10));

        let credited = run(&second, "credit", "a1", 5).await.unwrap();
        wait_for(&second, 1, credited[0].position().unwrap()).await;
        assert_eq!(balance(&second, "a1").await, json!(15));
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scheduled_commands_run_in_time_order() {
        let event_store = Arc::new(InMemoryEventStore::new());
        let runtime = Runtime::create(
            config(event_store.clone(), Arc::new(InMemoryStoreProvider::new()))
                .with_scheduler(Arc::new(LocalScheduler::default())),
        )
        .await
        .unwrap();

        let now = Utc::now();
        for (delay, amount) in [(50, 5), (10, 1)] {
            runtime
                .schedule_command(
                    now + chrono::Duration::milliseconds(delay),
                    "account",
                    "a1",
                    "credit",
                    json!({ "amount": amount }),
                    JsonValue::Null,
                )
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut stream = event_store.read("account", "a1", ReadOptions::default()).await.unwrap();
        let mut amounts = Vec::new();
        while let Some(Ok(event)) = stream.next().await {
            amounts.push(event.payload_as::<Credited>().unwrap().amount);
        }
        assert_eq!(amounts, vec![1, 5]);

        runtime.stop().await.unwrap();
    }

    #[test]
    fn duplicate_command_names_are_rejected() {
        let err = Aggregate::new("account", Account::default)
            .with_command(
                |_: &Account, _: JsonValue, _: &CommandContext| Ok(StateUpdate::None),
                CommandOptions::named("x"),
            )
            .unwrap()
            .with_command(
                |_: &Account, _: JsonValue, _: &CommandContext| Ok(StateUpdate::None),
                CommandOptions::named("x"),
            )
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
