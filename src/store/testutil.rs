//! Seed helpers shared by unit tests. Production provisioning of tenants,
//! users and rooms is an operator concern outside the Brain.

use uuid::Uuid;

use super::{fmt_ts, Db};

/// Insert a tenant row and return its id.
pub async fn seed_tenant(db: &Db, org_key: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO tenants (id, org_key, name, webhook_secret, timezone) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(id.to_string())
    .bind(org_key)
    .bind("Acme KK")
    .bind("secret-1")
    .bind("Asia/Tokyo")
    .execute(db.pool())
    .await
    .expect("seed tenant");
    id
}

/// Insert a user row and return its id.
pub async fn seed_user(db: &Db, tenant_id: Uuid, account_id: &str, name: &str, role: i64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO users (tenant_id, id, account_id, display_name, role_level) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(tenant_id.to_string())
    .bind(id.to_string())
    .bind(account_id)
    .bind(name)
    .bind(role)
    .execute(db.pool())
    .await
    .expect("seed user");
    id
}

/// Insert a room row.
pub async fn seed_room(db: &Db, tenant_id: Uuid, room_id: &str, name: &str, active: i64) {
    sqlx::query("INSERT INTO rooms (tenant_id, room_id, name, is_active) VALUES (?1, ?2, ?3, ?4)")
        .bind(tenant_id.to_string())
        .bind(room_id)
        .bind(name)
        .bind(active)
        .execute(db.pool())
        .await
        .expect("seed room");
}

/// Insert an open task and return its id.
pub async fn seed_task(
    db: &Db,
    tenant_id: Uuid,
    room_id: &str,
    assignee: Uuid,
    body: &str,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO tasks (tenant_id, id, room_id, assignee_user_id, body, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6)",
    )
    .bind(tenant_id.to_string())
    .bind(id.to_string())
    .bind(room_id)
    .bind(assignee.to_string())
    .bind(body)
    .bind(fmt_ts(chrono::Utc::now()))
    .execute(db.pool())
    .await
    .expect("seed task");
    id
}

/// Insert an active, verified teaching and return its id.
pub async fn seed_teaching(
    db: &Db,
    tenant_id: Uuid,
    statement: &str,
    category: &str,
    priority: i64,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO ceo_teachings \
           (tenant_id, id, ceo_user_id, statement, category, priority, is_active, \
            validation_status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 'verified', ?7)",
    )
    .bind(tenant_id.to_string())
    .bind(id.to_string())
    .bind(Uuid::new_v4().to_string())
    .bind(statement)
    .bind(category)
    .bind(priority)
    .bind(fmt_ts(chrono::Utc::now()))
    .execute(db.pool())
    .await
    .expect("seed teaching");
    id
}

/// Insert a person row.
pub async fn seed_person(db: &Db, tenant_id: Uuid, name: &str, account_id: Option<&str>) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO persons (tenant_id, id, name, account_id) VALUES (?1, ?2, ?3, ?4)")
        .bind(tenant_id.to_string())
        .bind(id.to_string())
        .bind(name)
        .bind(account_id)
        .execute(db.pool())
        .await
        .expect("seed person");
    id
}
