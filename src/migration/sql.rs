//! PostgreSQL DDL rendering
//!
//! Every identifier is double-quoted. Type names, defaults and expressions
//! are embedded verbatim after checking they cannot terminate the statement.

use crate::error::AppError;
use crate::schema::model::*;
use crate::schema::{ColumnChange, TableChanges};

/// Quote a string literal, doubling embedded quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Reject text that could end the statement or start a comment outside quotes
pub fn ensure_fragment(object: &str, text: &str) -> Result<(), AppError> {
    let mut in_single = false;
    let mut in_double = false;
    let mut prev = '\0';

    for c in text.chars() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' if !in_single && !in_double => {
                return Err(fragment_error(object, text, "statement terminator"));
            }
            '-' if prev == '-' && !in_single && !in_double => {
                return Err(fragment_error(object, text, "comment marker"));
            }
            '*' if prev == '/' && !in_single && !in_double => {
                return Err(fragment_error(object, text, "block comment"));
            }
            _ => {}
        }
        prev = c;
    }

    if in_single || in_double {
        return Err(fragment_error(object, text, "unbalanced quote"));
    }
    Ok(())
}

fn fragment_error(object: &str, text: &str, what: &str) -> AppError {
    AppError::MigrationGeneration {
        object: object.to_string(),
        message: format!("{} outside quotes in '{}'", what, text),
    }
}

fn if_exists(safe: bool) -> &'static str {
    if safe {
        " IF EXISTS"
    } else {
        ""
    }
}

fn if_not_exists(safe: bool) -> &'static str {
    if safe {
        " IF NOT EXISTS"
    } else {
        ""
    }
}

fn cascade(safe: bool) -> &'static str {
    if safe {
        ""
    } else {
        " CASCADE"
    }
}

fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

// ---------------------------------------------------------------- extensions

pub fn create_extension(ext: &ExtensionDefinition, safe: bool) -> String {
    format!(
        "CREATE EXTENSION{} {} WITH SCHEMA {} VERSION {};",
        if_not_exists(safe),
        quote_ident(&ext.name),
        quote_ident(&ext.schema),
        quote_literal(&ext.version)
    )
}

pub fn drop_extension(ext: &ExtensionDefinition, safe: bool) -> String {
    format!("DROP EXTENSION{} {}{};", if_exists(safe), quote_ident(&ext.name), cascade(safe))
}

pub fn alter_extension(before: &ExtensionDefinition, after: &ExtensionDefinition) -> String {
    let mut statements = Vec::new();
    if before.version != after.version {
        statements.push(format!(
            "ALTER EXTENSION {} UPDATE TO {};",
            quote_ident(&after.name),
            quote_literal(&after.version)
        ));
    }
    if before.schema != after.schema {
        statements.push(format!(
            "ALTER EXTENSION {} SET SCHEMA {};",
            quote_ident(&after.name),
            quote_ident(&after.schema)
        ));
    }
    statements.join("\n")
}

// -------------------------------------------------------------------- tables

fn column_definition(table: &str, column: &ColumnDefinition) -> Result<String, AppError> {
    let object = format!("{}.{}", table, column.name);
    ensure_fragment(&object, &column.data_type)?;
    let mut def = format!("{} {}", quote_ident(&column.name), column.data_type);
    if !column.nullable {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default_value {
        ensure_fragment(&object, default)?;
        def.push_str(&format!(" DEFAULT {}", default));
    }
    Ok(def)
}

fn constraint_clause(table: &str, constraint: &ConstraintDefinition) -> Result<String, AppError> {
    ensure_fragment(&format!("{}.{}", table, constraint.name), &constraint.definition)?;
    Ok(format!(
        "CONSTRAINT {} {}",
        quote_ident(&constraint.name),
        constraint.definition
    ))
}

/// In safe mode a same-named constraint is dropped first so reruns succeed
pub fn add_constraint(table: &TableDefinition, constraint: &ConstraintDefinition, safe: bool) -> Result<String, AppError> {
    let target = qualified(&table.schema, &table.name);
    let add = format!("ALTER TABLE {} ADD {};", target, constraint_clause(&table.key(), constraint)?);
    if !safe {
        return Ok(add);
    }
    Ok(format!(
        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};\n{}",
        target,
        quote_ident(&constraint.name),
        add
    ))
}

fn comment_statement(table: &TableDefinition, comment: Option<&str>) -> String {
    format!(
        "COMMENT ON TABLE {} IS {};",
        qualified(&table.schema, &table.name),
        comment.map(quote_literal).unwrap_or_else(|| "NULL".to_string())
    )
}

fn rls_statement(table: &TableDefinition, enabled: bool) -> String {
    format!(
        "ALTER TABLE {} {} ROW LEVEL SECURITY;",
        qualified(&table.schema, &table.name),
        if enabled { "ENABLE" } else { "DISABLE" }
    )
}

pub fn create_table(table: &TableDefinition, safe: bool) -> Result<String, AppError> {
    let key = table.key();
    let mut lines = Vec::new();
    for column in &table.columns {
        lines.push(format!("    {}", column_definition(&key, column)?));
    }
    for constraint in &table.constraints {
        lines.push(format!("    {}", constraint_clause(&key, constraint)?));
    }

    let mut sql = format!(
        "CREATE TABLE{} {} (\n{}\n);",
        if_not_exists(safe),
        qualified(&table.schema, &table.name),
        lines.join(",\n")
    );
    if table.comment.is_some() {
        sql.push('\n');
        sql.push_str(&comment_statement(table, table.comment.as_deref()));
    }
    if table.row_level_security {
        sql.push('\n');
        sql.push_str(&rls_statement(table, true));
    }
    Ok(sql)
}

pub fn drop_table(table: &TableDefinition, safe: bool) -> String {
    format!(
        "DROP TABLE{} {}{};",
        if_exists(safe),
        qualified(&table.schema, &table.name),
        cascade(safe)
    )
}

fn modify_column(target: &str, key: &str, change: &ColumnChange) -> Result<Vec<String>, AppError> {
    let column = quote_ident(&change.name);
    let mut statements = Vec::new();

    if change.type_changed() {
        ensure_fragment(&format!("{}.{}", key, change.name), &change.after.data_type)?;
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{};",
            target, column, change.after.data_type, column, change.after.data_type
        ));
    }
    if change.nullability_changed() {
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} {} NOT NULL;",
            target,
            column,
            if change.after.nullable { "DROP" } else { "SET" }
        ));
    }
    if change.default_changed() {
        match &change.after.default_value {
            Some(default) => {
                ensure_fragment(&format!("{}.{}", key, change.name), default)?;
                statements.push(format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {};",
                    target, column, default
                ));
            }
            None => statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT;",
                target, column
            )),
        }
    }
    Ok(statements)
}

/// Constraint drops first, then columns, then constraint adds
pub fn alter_table(table: &TableDefinition, changes: &TableChanges, safe: bool) -> Result<String, AppError> {
    let key = table.key();
    let target = qualified(&table.schema, &table.name);
    let mut statements = Vec::new();

    for constraint in &changes.constraints_dropped {
        statements.push(format!(
            "ALTER TABLE {} DROP CONSTRAINT{} {};",
            target,
            if_exists(safe),
            quote_ident(&constraint.name)
        ));
    }
    for column in &changes.columns_dropped {
        statements.push(format!(
            "ALTER TABLE {} DROP COLUMN{} {};",
            target,
            if_exists(safe),
            quote_ident(&column.name)
        ));
    }
    for column in &changes.columns_added {
        statements.push(format!(
            "ALTER TABLE {} ADD COLUMN{} {};",
            target,
            if_not_exists(safe),
            column_definition(&key, column)?
        ));
    }
    for change in &changes.columns_modified {
        statements.extend(modify_column(&target, &key, change)?);
    }
    for constraint in &changes.constraints_added {
        statements.push(add_constraint(table, constraint, safe)?);
    }
    if let Some(comment) = &changes.comment {
        statements.push(comment_statement(table, comment.after.as_deref()));
    }
    if let Some(rls) = &changes.row_level_security {
        statements.push(rls_statement(table, rls.after));
    }

    Ok(statements.join("\n"))
}

// ----------------------------------------------------------------- functions

fn function_arguments(function: &FunctionDefinition) -> Result<String, AppError> {
    let key = function.key();
    function
        .parameters
        .iter()
        .map(|p| {
            ensure_fragment(&key, &p.data_type)?;
            let mode = match p.mode {
                ParameterMode::In => "",
                ParameterMode::Out => "OUT ",
                ParameterMode::InOut => "INOUT ",
                ParameterMode::Variadic => "VARIADIC ",
            };
            Ok(match &p.name {
                Some(name) => format!("{}{} {}", mode, quote_ident(name), p.data_type),
                None => format!("{}{}", mode, p.data_type),
            })
        })
        .collect::<Result<Vec<_>, AppError>>()
        .map(|args| args.join(", "))
}

/// Dollar-quote tag that does not occur in the body
fn dollar_tag(body: &str) -> String {
    let mut tag = "$fn$".to_string();
    let mut n = 0;
    while body.contains(&tag) {
        n += 1;
        tag = format!("$fn{}$", n);
    }
    tag
}

fn function_signature(function: &FunctionDefinition) -> String {
    let identity: Vec<String> = function
        .parameters
        .iter()
        .filter(|p| p.mode != ParameterMode::Out)
        .map(|p| p.data_type.clone())
        .collect();
    format!("{}({})", qualified(&function.schema, &function.name), identity.join(", "))
}

pub fn create_function(function: &FunctionDefinition, or_replace: bool) -> Result<String, AppError> {
    let key = function.key();
    ensure_fragment(&key, &function.return_type)?;
    if !function.language.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::MigrationGeneration {
            object: key,
            message: format!("invalid language '{}'", function.language),
        });
    }

    let tag = dollar_tag(&function.body);
    Ok(format!(
        "CREATE {}FUNCTION {}({})\nRETURNS {}\nLANGUAGE {}\n{}{}\nAS {}{}{};",
        if or_replace { "OR REPLACE " } else { "" },
        qualified(&function.schema, &function.name),
        function_arguments(function)?,
        function.return_type,
        function.language,
        function.volatility.as_sql(),
        if function.security_definer { "\nSECURITY DEFINER" } else { "" },
        tag,
        function.body,
        tag
    ))
}

pub fn drop_function(function: &FunctionDefinition, safe: bool) -> String {
    format!(
        "DROP FUNCTION{} {}{};",
        if_exists(safe),
        function_signature(function),
        cascade(safe)
    )
}

/// `CREATE OR REPLACE` cannot change a return type; that needs a drop first
pub fn alter_function(
    before: &FunctionDefinition,
    after: &FunctionDefinition,
    return_type_changed: bool,
) -> Result<String, AppError> {
    if return_type_changed {
        Ok(format!(
            "{}\n{}",
            drop_function(before, true),
            create_function(after, false)?
        ))
    } else {
        create_function(after, true)
    }
}

// ------------------------------------------------------------------ triggers

pub fn create_trigger(trigger: &TriggerDefinition, or_replace: bool) -> Result<String, AppError> {
    let events: Vec<&str> = trigger.events.iter().map(|e| e.as_sql()).collect();
    if events.is_empty() {
        return Err(AppError::MigrationGeneration {
            object: trigger.key(),
            message: "trigger has no events".to_string(),
        });
    }
    let condition = match &trigger.condition {
        Some(cond) => {
            ensure_fragment(&trigger.key(), cond)?;
            format!("\nWHEN ({})", cond)
        }
        None => String::new(),
    };

    Ok(format!(
        "CREATE {}TRIGGER {}\n{} {} ON {}\nFOR EACH {}{}\nEXECUTE FUNCTION {}();",
        if or_replace { "OR REPLACE " } else { "" },
        quote_ident(&trigger.name),
        trigger.timing.as_sql(),
        events.join(" OR "),
        qualified(&trigger.schema, &trigger.table),
        if trigger.for_each_row { "ROW" } else { "STATEMENT" },
        condition,
        qualified(&trigger.function_schema, &trigger.function_name)
    ))
}

pub fn drop_trigger(trigger: &TriggerDefinition, safe: bool) -> String {
    format!(
        "DROP TRIGGER{} {} ON {};",
        if_exists(safe),
        quote_ident(&trigger.name),
        qualified(&trigger.schema, &trigger.table)
    )
}

// ------------------------------------------------------------------- indexes

pub fn create_index(index: &IndexDefinition, safe: bool) -> Result<String, AppError> {
    if !index.index_type.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::MigrationGeneration {
            object: index.key(),
            message: format!("invalid index method '{}'", index.index_type),
        });
    }
    let predicate = match &index.predicate {
        Some(pred) => {
            ensure_fragment(&index.key(), pred)?;
            format!(" WHERE {}", pred)
        }
        None => String::new(),
    };

    Ok(format!(
        "CREATE {}INDEX{} {} ON {} USING {} ({}){};",
        if index.unique { "UNIQUE " } else { "" },
        if_not_exists(safe),
        quote_ident(&index.name),
        qualified(&index.schema, &index.table),
        index.index_type,
        column_list(&index.columns),
        predicate
    ))
}

pub fn drop_index(index: &IndexDefinition, safe: bool) -> String {
    format!(
        "DROP INDEX{} {}{};",
        if_exists(safe),
        qualified(&index.schema, &index.name),
        cascade(safe)
    )
}

// ------------------------------------------------------------------ policies

fn policy_roles(roles: &[String]) -> String {
    if roles.is_empty() {
        return "PUBLIC".to_string();
    }
    roles
        .iter()
        .map(|r| match r.to_lowercase().as_str() {
            "public" => "PUBLIC".to_string(),
            "current_user" => "CURRENT_USER".to_string(),
            "session_user" => "SESSION_USER".to_string(),
            _ => quote_ident(r),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Policies have no `IF NOT EXISTS`; safe mode drops any leftover first
pub fn create_policy(policy: &PolicyDefinition, safe: bool) -> Result<String, AppError> {
    let key = policy.key();
    let mut sql = String::new();
    if safe {
        sql.push_str(&drop_policy(policy, true));
        sql.push('\n');
    }

    sql.push_str(&format!(
        "CREATE POLICY {} ON {}\nAS {}\nFOR {}\nTO {}",
        quote_ident(&policy.name),
        qualified(&policy.schema, &policy.table),
        if policy.permissive { "PERMISSIVE" } else { "RESTRICTIVE" },
        policy.command.as_sql(),
        policy_roles(&policy.roles)
    ));
    if let Some(using) = &policy.using_expression {
        ensure_fragment(&key, using)?;
        sql.push_str(&format!("\nUSING ({})", using));
    }
    if let Some(check) = &policy.check_expression {
        ensure_fragment(&key, check)?;
        sql.push_str(&format!("\nWITH CHECK ({})", check));
    }
    sql.push(';');
    Ok(sql)
}

pub fn drop_policy(policy: &PolicyDefinition, safe: bool) -> String {
    format!(
        "DROP POLICY{} {} ON {};",
        if_exists(safe),
        quote_ident(&policy.name),
        qualified(&policy.schema, &policy.table)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_fragment_accepts_quoted_semicolons() {
        assert!(ensure_fragment("t", "'a;b'::text").is_ok());
        assert!(ensure_fragment("t", "numeric(10,2)").is_ok());
    }

    #[test]
    fn test_fragment_rejects_terminators_and_comments() {
        assert!(ensure_fragment("t", "integer; DROP TABLE users").is_err());
        assert!(ensure_fragment("t", "now() -- sneaky").is_err());
        assert!(ensure_fragment("t", "'unterminated").is_err());
    }

    #[test]
    fn test_fragment_rejects_block_comments() {
        assert!(ensure_fragment("t", "integer /* hidden */").is_err());
        assert!(ensure_fragment("t", "now()/**/").is_err());
        assert!(ensure_fragment("t", "'/* quoted */'::text").is_ok());
        assert!(ensure_fragment("t", "price / 2").is_ok());
    }

    #[test]
    fn test_safe_constraint_add_can_rerun() {
        let table = fixtures::orders_table();
        let fk = &table.constraints[1];
        assert_eq!(
            add_constraint(&table, fk, true).unwrap(),
            "ALTER TABLE \"public\".\"orders\" DROP CONSTRAINT IF EXISTS \"orders_customer_id_fkey\";\n\
             ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"orders_customer_id_fkey\" \
             FOREIGN KEY (customer_id) REFERENCES public.customers(id);"
        );
        assert!(!add_constraint(&table, fk, false).unwrap().contains("DROP"));
    }

    #[test]
    fn test_create_table_quotes_identifiers() {
        let mut table = fixtures::orders_table();
        table.name = "order\"s".to_string();
        let sql = create_table(&table, true).unwrap();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"order\"\"s\""));
        assert!(sql.contains("\"amount\" numeric(10,2) NOT NULL"));
    }

    #[test]
    fn test_safe_mode_never_cascades() {
        let table = fixtures::orders_table();
        assert_eq!(drop_table(&table, true), "DROP TABLE IF EXISTS \"public\".\"orders\";");
        assert_eq!(drop_table(&table, false), "DROP TABLE \"public\".\"orders\" CASCADE;");
    }

    #[test]
    fn test_function_body_uses_free_dollar_tag() {
        let mut function = fixtures::function("public", "calc_tax", &["numeric"]);
        function.body = "SELECT '$fn$'".to_string();
        let sql = create_function(&function, true).unwrap();
        assert!(sql.contains("AS $fn1$SELECT '$fn$'$fn1$;"));
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION \"public\".\"calc_tax\"(\"arg1\" numeric)"));
    }

    #[test]
    fn test_policy_roles_rendering() {
        assert_eq!(policy_roles(&[]), "PUBLIC");
        assert_eq!(
            policy_roles(&["public".to_string(), "app_user".to_string()]),
            "PUBLIC, \"app_user\""
        );
    }
}
