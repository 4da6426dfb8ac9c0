use brookstore_memory::InMemoryDocumentStore;
use brookstore_testing::document_store_contract_tests;

document_store_contract_tests!(suite = in_memory, make_store = InMemoryDocumentStore::new);
