// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DynamoDB implementation of the lock store.

use std::collections::HashMap;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use aws_sdk_dynamodb::config::{Credentials, Region};
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus, TimeToLiveSpecification,
};
use tokio::time::sleep;

use crate::options::LockerOptions;
use crate::store::{
    ATTR_ID, ATTR_LEASE, ATTR_REVISION, ATTR_TTL, DeleteOutcome, Error, ErrorKind, LockItem,
    LockStore, PutOutcome, RetryPolicy, UpdateOutcome,
};

/// Conditional-write adapter over a DynamoDB table.
///
/// The client holds no lock state; it translates the five store operations
/// into conditional DynamoDB calls, retries transient failures under its
/// retry schedules, and folds conditional-check failures into outcomes.
#[derive(Debug)]
pub struct Client {
    client: DynamoDbClient,
    acquire_retry: RetryPolicy,
    heartbeat_retry: RetryPolicy,
    provision_retry: RetryPolicy,
}

/// How a failed store call should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorClass {
    /// Worth retrying under the operation's schedule.
    Transient,
    /// A conditional check failed; an outcome, not an error.
    Conditional,
    /// Not retryable.
    Fatal,
}

fn class_for_code(code: Option<&str>) -> ErrorClass {
    match code {
        Some("ConditionalCheckFailedException") => ErrorClass::Conditional,
        Some(
            "InternalServerError"
            | "LimitExceededException"
            | "ProvisionedThroughputExceededException"
            | "RequestLimitExceeded"
            | "ServiceUnavailable"
            | "ThrottlingException"
            | "TransactionConflictException",
        ) => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

fn classify<E: ProvideErrorMetadata>(error: &SdkError<E>) -> ErrorClass {
    match error {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            ErrorClass::Transient
        }
        _ => class_for_code(ProvideErrorMetadata::code(error)),
    }
}

fn render<E: std::error::Error + 'static>(error: &SdkError<E>) -> String {
    format!("{}", DisplayErrorContext(error))
}

fn read_n(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    attrs.get(key)?.as_n().ok()?.parse().ok()
}

fn read_s<'a>(attrs: &'a HashMap<String, AttributeValue>, key: &str) -> Option<&'a str> {
    attrs.get(key)?.as_s().ok().map(String::as_str)
}

/// A record missing any lock attribute, or with an empty revision, reads
/// the same as an absent record.
fn parse_item(attrs: &HashMap<String, AttributeValue>) -> Option<LockItem> {
    let lease_ms = u64::try_from(read_n(attrs, ATTR_LEASE)?).ok()?;
    let revision = read_s(attrs, ATTR_REVISION)?;
    if revision.is_empty() {
        return None;
    }
    let ttl_unix = read_n(attrs, ATTR_TTL)?;
    Some(LockItem::new(
        Duration::from_millis(lease_ms),
        revision.to_owned(),
        ttl_unix,
    ))
}

impl Client {
    /// Build a client from resolved options.
    ///
    /// The region comes from the explicit option when present, otherwise the
    /// SDK's default provider chain (`AWS_REGION`/`AWS_DEFAULT_REGION`, the
    /// shared profile, and so on). An endpoint override installs static
    /// placeholder credentials, since local endpoints accept any signature.
    pub async fn new(options: &LockerOptions) -> Self {
        let region = RegionProviderChain::first_try(options.region.clone().map(Region::new))
            .or_default_provider();
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
        if let Some(endpoint) = options.endpoint.as_deref() {
            loader = loader.endpoint_url(endpoint).credentials_provider(
                Credentials::new("dummy", "dummy", None, None, "endpoint-override"),
            );
        }
        let config = loader.load().await;
        Self {
            client: DynamoDbClient::new(&config),
            acquire_retry: RetryPolicy::acquire_default(),
            heartbeat_retry: RetryPolicy::heartbeat_default(),
            provision_retry: RetryPolicy::provision_default(),
        }
    }

    /// Replace the retry schedules, mainly for tests against local endpoints.
    #[must_use]
    pub fn with_retry_policies(
        mut self,
        acquire: RetryPolicy,
        heartbeat: RetryPolicy,
        provision: RetryPolicy,
    ) -> Self {
        self.acquire_retry = acquire;
        self.heartbeat_retry = heartbeat;
        self.provision_retry = provision;
        self
    }

    /// The region the client resolved at construction.
    #[must_use]
    pub fn region(&self) -> Option<String> {
        self.client.config().region().map(ToString::to_string)
    }

    async fn table_usable(&self, table: &str) -> Result<bool, Error> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(output) => {
                let status = output.table().and_then(|t| t.table_status().cloned());
                log::debug!("table {table} status is {status:?}");
                Ok(matches!(
                    status,
                    Some(TableStatus::Active | TableStatus::Updating)
                ))
            }
            Err(error)
                if ProvideErrorMetadata::code(&error) == Some("ResourceNotFoundException") =>
            {
                Ok(false)
            }
            Err(error) => Err(ErrorKind::Provision(render(&error)).into()),
        }
    }

    async fn wait_table_usable(&self, table: &str) -> Result<(), Error> {
        let mut failed_attempts = 0;
        loop {
            match self.table_usable(table).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(error) => log::debug!("describe failed while waiting for {table}: {error}"),
            }
            failed_attempts += 1;
            let Some(delay) = self.provision_retry.backoff(failed_attempts) else {
                return Err(
                    ErrorKind::Provision(format!("table {table} did not become active")).into(),
                );
            };
            log::debug!("waiting {delay:?} for lock table {table} to become active");
            sleep(delay).await;
        }
    }

    async fn enable_record_expiry(&self, table: &str) -> Result<(), Error> {
        let specification = TimeToLiveSpecification::builder()
            .attribute_name(ATTR_TTL)
            .enabled(true)
            .build()
            .expect("Unreachable because all parameters that could cause errors are statically provided");
        self.client
            .update_time_to_live()
            .table_name(table)
            .time_to_live_specification(specification)
            .send()
            .await
            .map_err(|error| Error::from(ErrorKind::Provision(render(&error))))?;
        log::debug!("record expiry enabled on `{ATTR_TTL}` for {table}");
        Ok(())
    }

    fn key_for(id: &str) -> AttributeValue {
        AttributeValue::S(id.to_owned())
    }
}

impl LockStore for Client {
    fn acquire_retry(&self) -> &RetryPolicy {
        &self.acquire_retry
    }

    async fn provision_table(&self, table: &str) -> Result<(), Error> {
        if self.table_usable(table).await? {
            return Ok(());
        }
        log::debug!("creating lock table {table}");
        let attribute = AttributeDefinition::builder()
            .attribute_name(ATTR_ID)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .expect("Unreachable because all parameters that could cause errors are statically provided");
        let key_schema = KeySchemaElement::builder()
            .attribute_name(ATTR_ID)
            .key_type(KeyType::Hash)
            .build()
            .expect("Unreachable because all parameters that could cause errors are statically provided");
        match self
            .client
            .create_table()
            .table_name(table)
            .attribute_definitions(attribute)
            .key_schema(key_schema)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
        {
            Ok(_) => {
                log::debug!("created lock table {table}");
                self.wait_table_usable(table).await?;
                self.enable_record_expiry(table).await
            }
            // Another process is creating the table; wait for it to settle.
            Err(error)
                if ProvideErrorMetadata::code(&error) == Some("ResourceInUseException") =>
            {
                self.wait_table_usable(table).await
            }
            Err(error) => Err(ErrorKind::Provision(render(&error)).into()),
        }
    }

    async fn put_if_absent(
        &self,
        table: &str,
        id: &str,
        item: &LockItem,
    ) -> Result<PutOutcome, Error> {
        let mut failed_attempts = 0;
        loop {
            log::debug!(
                "conditional put table={table} id={id} revision={}",
                item.revision()
            );
            let result = self
                .client
                .put_item()
                .table_name(table)
                .item(ATTR_ID, Self::key_for(id))
                .item(ATTR_LEASE, AttributeValue::N(item.lease_ms().to_string()))
                .item(ATTR_REVISION, AttributeValue::S(item.revision().clone()))
                .item(ATTR_TTL, AttributeValue::N(item.ttl_unix().to_string()))
                .condition_expression("attribute_not_exists(ID)")
                .send()
                .await;
            let error = match result {
                Ok(_) => {
                    log::debug!("lock record written with expiry {}", item.ttl_unix());
                    return Ok(PutOutcome::Inserted);
                }
                Err(error) => error,
            };
            match classify(&error) {
                ErrorClass::Conditional => {
                    log::debug!("lock record already present");
                    return Ok(PutOutcome::Exists);
                }
                ErrorClass::Fatal => return Err(ErrorKind::Fatal(render(&error)).into()),
                ErrorClass::Transient => {
                    failed_attempts += 1;
                    let Some(delay) = self.acquire_retry.backoff(failed_attempts) else {
                        return Err(ErrorKind::Unavailable(render(&error)).into());
                    };
                    log::warn!(
                        "conditional put failed, retrying in {delay:?}: {}",
                        render(&error)
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn update_if_revision_matches(
        &self,
        table: &str,
        id: &str,
        item: &LockItem,
        expected_revision: &str,
    ) -> Result<UpdateOutcome, Error> {
        let mut failed_attempts = 0;
        loop {
            log::debug!(
                "conditional update table={table} id={id} revision={} expected={expected_revision}",
                item.revision()
            );
            let result = self
                .client
                .update_item()
                .table_name(table)
                .key(ATTR_ID, Self::key_for(id))
                .update_expression("SET #LeaseDuration = :LeaseDuration, #Revision = :Revision, #ttl = :ttl")
                .condition_expression("attribute_not_exists(ID) OR Revision = :PrevRevision")
                .expression_attribute_names("#LeaseDuration", ATTR_LEASE)
                .expression_attribute_names("#Revision", ATTR_REVISION)
                .expression_attribute_names("#ttl", ATTR_TTL)
                .expression_attribute_values(
                    ":LeaseDuration",
                    AttributeValue::N(item.lease_ms().to_string()),
                )
                .expression_attribute_values(
                    ":Revision",
                    AttributeValue::S(item.revision().clone()),
                )
                .expression_attribute_values(":ttl", AttributeValue::N(item.ttl_unix().to_string()))
                .expression_attribute_values(
                    ":PrevRevision",
                    AttributeValue::S(expected_revision.to_owned()),
                )
                .send()
                .await;
            let error = match result {
                Ok(_) => return Ok(UpdateOutcome::Written),
                Err(error) => error,
            };
            match classify(&error) {
                ErrorClass::Conditional => return Ok(UpdateOutcome::Conflict),
                ErrorClass::Fatal => return Err(ErrorKind::Fatal(render(&error)).into()),
                ErrorClass::Transient => {
                    failed_attempts += 1;
                    let Some(delay) = self.heartbeat_retry.backoff(failed_attempts) else {
                        return Err(ErrorKind::Unavailable(render(&error)).into());
                    };
                    log::warn!(
                        "conditional update failed, retrying in {delay:?}: {}",
                        render(&error)
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn read_consistent(&self, table: &str, id: &str) -> Result<Option<LockItem>, Error> {
        log::debug!("consistent read table={table} id={id}");
        let output = self
            .client
            .get_item()
            .table_name(table)
            .key(ATTR_ID, Self::key_for(id))
            .consistent_read(true)
            .send()
            .await
            .map_err(|error| match classify(&error) {
                ErrorClass::Transient => Error::from(ErrorKind::Unavailable(render(&error))),
                _ => Error::from(ErrorKind::Fatal(render(&error))),
            })?;
        Ok(output.item().and_then(parse_item))
    }

    async fn delete_if_revision_matches(
        &self,
        table: &str,
        id: &str,
        expected_revision: &str,
    ) -> Result<DeleteOutcome, Error> {
        let mut failed_attempts = 0;
        loop {
            log::debug!("conditional delete table={table} id={id} expected={expected_revision}");
            let result = self
                .client
                .delete_item()
                .table_name(table)
                .key(ATTR_ID, Self::key_for(id))
                .condition_expression("attribute_exists(ID) AND Revision = :PrevRevision")
                .expression_attribute_values(
                    ":PrevRevision",
                    AttributeValue::S(expected_revision.to_owned()),
                )
                .send()
                .await;
            let error = match result {
                Ok(_) => return Ok(DeleteOutcome::Deleted),
                Err(error) => error,
            };
            match classify(&error) {
                ErrorClass::Conditional => return Ok(DeleteOutcome::Conflict),
                ErrorClass::Fatal => return Err(ErrorKind::Fatal(render(&error)).into()),
                ErrorClass::Transient => {
                    failed_attempts += 1;
                    let Some(delay) = self.heartbeat_retry.backoff(failed_attempts) else {
                        return Err(ErrorKind::Unavailable(render(&error)).into());
                    };
                    log::warn!(
                        "conditional delete failed, retrying in {delay:?}: {}",
                        render(&error)
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
