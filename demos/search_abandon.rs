// Demonstrates the use of Abandon after prematurely terminating
// the Search stream.

use ldaplink::result::Result;
use ldaplink::{Connection, Scope};

#[tokio::main]
async fn main() -> Result<()> {
    let (conn, mut ldap) = Connection::new("ldap://localhost:2389").await?;
    ldaplink::drive!(conn);
    let mut stream = ldap
        .streaming_search(
            "ou=Places,dc=example,dc=org",
            Scope::WholeSubtree,
            "objectClass=locality",
            vec!["l"],
        )
        .await?;
    #[allow(clippy::never_loop)]
    while let Some(_r) = stream.next().await? {
        break;
    }
    let _res = stream.finish().await;
    let msgid = stream.ldap_handle().last_id();
    ldap.abandon(msgid).await?;
    Ok(ldap.unbind().await?)
}
