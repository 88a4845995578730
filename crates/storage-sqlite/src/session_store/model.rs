use diesel::prelude::*;

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(key))]
#[diesel(table_name = crate::schema::session_store)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SessionSecretDB {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}
