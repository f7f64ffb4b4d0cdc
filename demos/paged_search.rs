// Demonstrates a paged Search driven to completion through the
// RFC 2696 cookie loop.

use ldaplink::result::Result;
use ldaplink::{Connection, Scope, SearchEntry};

#[tokio::main]
async fn main() -> Result<()> {
    let (conn, mut ldap) = Connection::new("ldap://localhost:2389").await?;
    ldaplink::drive!(conn);
    let (entries, res) = ldap
        .search_with_paging(
            "ou=People,dc=example,dc=org",
            Scope::WholeSubtree,
            "(objectClass=inetOrgPerson)",
            vec!["uid", "cn"],
            500,
        )
        .await?
        .success()?;
    println!("{} entries, final rc={}", entries.len(), res.rc);
    for entry in entries {
        println!("{}", SearchEntry::construct(entry).dn);
    }
    Ok(ldap.unbind().await?)
}
