// Demonstrates the "Who Am I?" Extended operation with the
// async client.

use ldaplink::exop::{WhoAmI, WhoAmIResp};
use ldaplink::result::Result;
use ldaplink::Connection;

#[tokio::main]
async fn main() -> Result<()> {
    let (conn, mut ldap) = Connection::new("ldap://localhost:2389").await?;
    ldaplink::drive!(conn);
    let _res = ldap
        .simple_bind("cn=Manager,dc=example,dc=org", "secret")
        .await?
        .success()?;
    let (exop, _res) = ldap.extended(WhoAmI).await?.success()?;
    let whoami: WhoAmIResp = exop.parse();
    println!("{}", whoami.authzid);
    Ok(ldap.unbind().await?)
}
